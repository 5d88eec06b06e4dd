//! sessmon Client - Streaming session controller
//!
//! Connects to a backend event stream, folds it into a live
//! [`sessmon_core::Session`] and publishes snapshots to consumers:
//!
//! - `controller` - actor, handle and reconnect policy
//! - `intent` - optimistic command overlay
//! - `transport` - HTTP transport and the seam tests substitute
//! - `config` - layered configuration
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod controller;
pub mod error;
pub mod intent;
pub mod transport;

pub use config::{ClientConfig, StreamEndpoint, StreamMethod};
pub use controller::{
    CommandOutcome, ConnectionState, SessionController, SessionHandle, SessionSnapshot,
    RECONNECT_EXHAUSTED,
};
pub use error::{ClientError, Result, TransportError};
pub use intent::{Command, CommandAction, CommandIntent, IntentLedger};
pub use transport::{decode_stream, FrameStream, HttpTransport, SessionTransport};
