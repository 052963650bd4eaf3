//! rollcall-hw — Concrete collaborators for the attendance loop.
//!
//! Provides the serial-line RFID reader bridge and the JSON-lines frame feed
//! written by the external face detector.

pub mod frame;
pub mod token;

pub use frame::{Frame, FrameError, FrameSource, JsonLinesSource};
pub use token::{SerialTokenReader, MAX_TEXT_LEN};
