//! Wire protocol between the cadenza agent and its build worker.
//!
//! Transport is length-prefixed framing over the worker's stdin/stdout
//! (see [`framing`]); payloads are tagged-variant records (see [`command`],
//! [`event`], [`log`]). The same [`log::LogEntry`] encoding doubles as the
//! batch format shipped to the remote log service.

pub mod command;
pub mod error;
pub mod event;
pub mod framing;
pub mod log;
pub mod wire;

pub use command::{Command, LogSettings};
pub use error::{IoErrorContext, ProtocolError};
pub use event::Event;
pub use framing::{FrameReader, FrameWriter, MAX_FRAME_SIZE};
pub use log::{ActivityId, Level, LogEntry, LogField};
