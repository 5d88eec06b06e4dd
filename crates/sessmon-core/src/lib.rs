//! sessmon Core - Session model and reducer
//!
//! This crate provides the domain types shared between the wire protocol
//! (sessmon-protocol) and the streaming controller (sessmon-client), plus the
//! reducer that folds typed events into session state.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod approval;
pub mod error;
pub mod event;
pub mod output;
pub mod reducer;
pub mod session;
pub mod step;

// Re-exports for convenience
pub use approval::{ApprovalKind, ApprovalRequest};
pub use error::DomainError;
pub use event::{AnalysisStepStatus, SessionEvent};
pub use output::{OutputLevel, OutputLine};
pub use reducer::{apply, fold, Anomaly, Reduction, MAX_STEPS};
pub use session::{Session, SessionId, SessionStatus};
pub use step::{Step, StepStatus};
