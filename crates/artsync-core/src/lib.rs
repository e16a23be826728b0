//! artsync-core: pure reconciliation logic for one display/source pair.
//!
//! Everything in this crate is deterministic: time is passed in as
//! monotonic milliseconds (`now_ms`) or as a wall-clock time of day, and
//! no function performs IO. The async runtime lives in `artsync-daemon`.

pub mod activity;
pub mod backoff;
pub mod config;
pub mod deadline;
pub mod decision;
pub mod drift;
pub mod event_log;
pub mod governor;
pub mod types;

pub use activity::{
    ActiveMode, ActivitySignal, ActivityTiming, ActivityTracker, ConnectionState, SourceReport,
};
pub use backoff::{Backoff, LogThrottle, MessageThrottle};
pub use config::{ConfigError, InputSource, PairConfig};
pub use deadline::Deadline;
pub use decision::{
    ActiveWindow, AwayPolicy, Decision, DecisionInputs, NightBehavior, PresenceMode, TimeOfDay,
    UnknownBehavior, classify_presence, decide,
};
pub use drift::{DriftLimits, DriftTracker, is_drift};
pub use event_log::{EventLog, EventLogEntry, render_text};
pub use governor::{CommandRecord, Gate, GovernorLimits, SafetyGovernor};
pub use types::{
    ActionResult, DesiredMode, DisplayState, EventKind, Health, Phase, PlaybackState, PowerState,
    Presence, Trigger,
};
