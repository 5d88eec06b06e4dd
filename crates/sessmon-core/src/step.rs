//! Steps: discrete phases of a session's backend work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single step.
///
/// Legal transitions are `pending → running → {completed, error, skipped}`,
/// plus finishing a step straight from `pending` (done marker, failure
/// before start). See [`StepStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    #[serde(alias = "complete")]
    Completed,
    #[serde(alias = "failed")]
    Error,
    Skipped,
}

impl StepStatus {
    /// Returns the wire label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true if the step has finished one way or another.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Skipped)
    }

    /// Returns true if moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One unit of backend work.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Progress detail reported by analysis flows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Evidence attached by analysis flows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

impl Step {
    /// Creates a pending step.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Marks the step running. Returns false on an illegal transition.
    pub fn start(&mut self, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(StepStatus::Running) {
            return false;
        }
        self.status = StepStatus::Running;
        self.started_at = Some(at);
        true
    }

    /// Moves the step into a terminal status. Returns false on an illegal transition.
    pub fn finish(&mut self, status: StepStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.completed_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Error));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Skipped));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Completed));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Error.can_transition_to(StepStatus::Completed));
    }

    #[test]
    fn test_finish_rejects_completed_step() {
        let now = Utc::now();
        let mut step = Step::new("a", "A");
        assert!(step.start(now));
        assert!(step.finish(StepStatus::Completed, now));
        assert!(!step.start(now));
        assert_eq!(step.status, StepStatus::Completed);
    }

    #[test]
    fn test_status_aliases_deserialize() {
        let s: StepStatus = serde_json::from_str("\"complete\"").unwrap();
        assert_eq!(s, StepStatus::Completed);
        let s: StepStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(s, StepStatus::Error);
    }
}
