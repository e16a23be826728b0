//! Time sources for the controller.
//!
//! Control decisions only ever compare monotonic milliseconds. Wall-clock
//! values are used for the time-of-day window and for presentation.

use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    /// Monotonic milliseconds since the clock was created.
    fn now_ms(&self) -> u64;
    /// Local time of day, for the active window.
    fn time_of_day(&self) -> NaiveTime;
    fn wall_now(&self) -> DateTime<Utc>;
}

/// Tokio's monotonic clock plus the host's local time.
///
/// Built on [`tokio::time::Instant`] so paused-time tests drive it too.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn time_of_day(&self) -> NaiveTime {
        Local::now().time()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Monotonic time from tokio, time of day set by hand.
#[derive(Debug)]
pub struct ManualClock {
    epoch: Instant,
    time_of_day: Mutex<NaiveTime>,
}

impl ManualClock {
    pub fn new(time_of_day: NaiveTime) -> Self {
        Self {
            epoch: Instant::now(),
            time_of_day: Mutex::new(time_of_day),
        }
    }

    /// `hh:mm` shorthand. Out-of-range values clamp to midnight.
    pub fn at(hour: u32, minute: u32) -> Self {
        Self::new(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default())
    }

    pub fn set_time_of_day(&self, t: NaiveTime) {
        *self
            .time_of_day
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = t;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn time_of_day(&self) -> NaiveTime {
        *self
            .time_of_day
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
