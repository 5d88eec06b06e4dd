//! Session aggregate and its identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ApprovalRequest, DomainError, OutputLine, Step, StepStatus};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a monitored session.
///
/// Assigned by the backend and treated as opaque: no format validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is empty (snapshots may omit it).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session Status
// ============================================================================

/// Operational status of a monitored session.
///
/// `Completed`, `Error` and `Stopped` are terminal: once reached, only a
/// snapshot event can move the session elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Nothing has happened yet.
    #[default]
    Idle,
    /// Backend is executing steps.
    Running,
    /// Execution paused by the user.
    Paused,
    /// Backend is blocked on an approval decision.
    WaitingApproval,
    /// Run finished successfully.
    Completed,
    /// Run failed.
    Error,
    /// Run was stopped by the user.
    Stopped,
}

impl SessionStatus {
    /// Returns the wire label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Returns true for statuses that end a session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "completed" | "complete" => Ok(Self::Completed),
            "error" | "failed" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(DomainError::invalid(
                "session status",
                other,
                "idle, running, paused, waiting_approval, completed, error or stopped",
            )),
        }
    }
}

// ============================================================================
// Session Aggregate
// ============================================================================

/// One monitored backend run: an analysis or an agent execution.
///
/// Mutated exclusively by [`crate::reducer::apply`]. Consumers only ever see
/// clones published by the controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    /// Discovery order; never reordered.
    pub steps: Vec<Step>,
    /// Id of the executing step. Ids may repeat across retries, so lookups
    /// go through [`Session::current_step`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Arrival order; never capped here.
    pub output: Vec<OutputLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<ApprovalRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Analysis mode announced by a `mode` event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    /// `validationStatus` taken from an analysis report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Creates an empty idle session.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Returns the step currently executing, if any.
    ///
    /// Searches from the end so a retried id resolves to its latest attempt.
    pub fn current_step(&self) -> Option<&Step> {
        let id = self.current_step_id.as_deref()?;
        self.steps
            .iter()
            .rev()
            .find(|s| s.id == id && s.status == StepStatus::Running)
    }

    /// Number of steps with `status = running`.
    pub fn running_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    /// Number of steps that reached `completed`.
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Fraction of finished steps as a percentage (0-100).
    ///
    /// Uses the announced total when present, otherwise the discovered steps.
    pub fn progress_percentage(&self) -> f64 {
        let total = self.total_steps.unwrap_or(self.steps.len()).max(self.steps.len());
        if total == 0 {
            return 0.0;
        }
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        (done as f64 / total as f64) * 100.0
    }

    /// Returns true once the session reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
