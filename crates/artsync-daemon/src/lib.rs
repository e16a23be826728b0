//! artsync-daemon: async control loop for display/source pairs.
//!
//! [`PairController`] owns all mutable state of one pair behind a single
//! mutex and runs its background tasks (activity monitor, resync tick,
//! time-window watcher, startup grace, delayed return). [`PairRegistry`]
//! maps pair ids to controllers and keeps pairs from sharing a display.

pub mod activity_monitor;
pub mod clock;
pub mod controller;
pub mod executor;
pub mod registry;
pub mod wake;

pub use activity_monitor::{ActivityEvent, ActivityMonitor, MonitorHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{ControlError, EnforceOutcome, PairController, PairDevices, PairStatus};
pub use executor::{DisplayExecutor, LadderOutcome};
pub use registry::{PairRegistry, RegistryError};
pub use wake::{WakeMethod, WakeReport, WakeSettings};
