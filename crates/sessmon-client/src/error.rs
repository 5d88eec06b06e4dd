//! Error types for the session client.
//!
//! Two layers:
//! - [`TransportError`]: what a [`crate::SessionTransport`] reports for a single
//!   open or send. The controller turns these into reconnects or command
//!   failures; they never end a session on their own.
//! - [`ClientError`]: what public controller and handle operations return.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use thiserror::Error;

use sessmon_core::SessionId;

// ============================================================================
// Transport Error Type
// ============================================================================

/// Failure of a single transport operation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection refused, reset or timed out.
    #[error("Request failed: {0}")]
    Request(String),

    /// The server answered with a non-2xx status.
    #[error("Server returned HTTP {status}")]
    HttpStatus { status: u16 },

    /// The body stream broke mid-read.
    #[error("Stream read failed: {0}")]
    Read(String),

    /// The configured URL could not be built for this session.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::HttpStatus {
                status: status.as_u16(),
            },
            None => Self::Request(e.to_string()),
        }
    }
}

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors returned by controller and handle operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The controller already monitors a different session.
    ///
    /// Close the current session before opening another one.
    #[error("Controller already monitors session {current}")]
    AlreadyOpen { current: SessionId },

    /// The session was closed; no further operations are served.
    #[error("Session closed")]
    Closed,

    /// The command could not be delivered. The optimistic intent stays in
    /// place until confirmed or rolled back.
    #[error("Command '{action}' failed: {reason}")]
    CommandFailed { action: String, reason: String },

    /// The session already reached a terminal status.
    #[error("Session already ended ({status})")]
    SessionEnded { status: String },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
