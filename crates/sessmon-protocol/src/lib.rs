//! sessmon Protocol - Wire format for session streams
//!
//! This crate turns raw stream bytes into typed [`sessmon_core::SessionEvent`]s
//! and defines the bodies of outbound control requests:
//!
//! - `frame` - line buffering and `data:` / event-stream framing
//! - `envelope` - JSON payload classification
//! - `message` - control and approval request bodies

pub mod envelope;
pub mod frame;
pub mod message;

pub use envelope::{classify, parse_frame, parse_payload, EnvelopeError};
pub use frame::{Frame, FrameDecoder, Framing, LineBuffer, DATA_PREFIX};
pub use message::{ApprovalDecision, ControlAction, ControlRequest, OutboundCommand};
