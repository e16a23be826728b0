//! artsync-device: device collaborator boundary.
//!
//! Defines the traits the controller drives (display, source, presence,
//! remote wake) with explicit [`DeviceError`] results, plus adapters that
//! drive real hardware through configured external commands. Every call
//! carries a timeout; nothing here decides what mode a display should be in.

pub mod command_display;
pub mod command_presence;
pub mod command_remote;
pub mod command_source;
pub mod error;
pub mod process;
pub mod traits;
pub mod wol;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use command_display::{CommandDisplay, DisplayCommands};
pub use command_presence::CommandPresence;
pub use command_remote::CommandRemote;
pub use command_source::CommandSource;
pub use error::{DeviceError, DeviceResult, looks_like_session_expiry};
pub use process::CommandSpec;
pub use traits::{DisplayDevice, PresenceSource, RemoteWake, SourceDevice, SourceSession};
