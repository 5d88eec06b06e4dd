//! Typed session events consumed by the reducer.
//!
//! Produced by the envelope parser in sessmon-protocol; this crate never
//! sees raw JSON frames.

use chrono::{DateTime, Utc};

use crate::{ApprovalRequest, OutputLine, Session, SessionStatus};

/// Status carried by an analysis step frame (`{step: n, status: ...}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisStepStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// One classified event from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    // === Analysis flows ===
    /// Announces the analysis mode and its step set; re-initializes the session.
    Mode {
        mode: String,
        total_steps: usize,
        labels: Vec<String>,
    },

    /// Progress of a numbered analysis step (1-based).
    StepIndex {
        step: usize,
        status: AnalysisStepStatus,
        detail: Option<String>,
        proof: Option<String>,
        at: DateTime<Utc>,
    },

    /// Sentinel: every non-terminal step is complete.
    StepsDone { at: DateTime<Utc> },

    /// Final analysis report.
    AnalysisResult {
        report: serde_json::Value,
        at: DateTime<Utc>,
    },

    // === Execution flows ===
    /// Full state replacement.
    Snapshot(Box<Session>),

    StepStarted {
        id: String,
        name: String,
        description: Option<String>,
        at: DateTime<Utc>,
    },

    StepCompleted {
        result: Option<serde_json::Value>,
        at: DateTime<Utc>,
    },

    Output(OutputLine),

    ApprovalRequired(ApprovalRequest),

    ApprovalResponded {
        approved: Option<bool>,
        response: Option<String>,
    },

    StatusChanged(SessionStatus),

    Completed {
        result: Option<serde_json::Value>,
        at: DateTime<Utc>,
    },

    // === Both ===
    /// Fatal backend error.
    Failed { error: String, at: DateTime<Utc> },

    /// Heartbeat with no semantic content.
    Keepalive,

    /// Unrecognized `type` or shape.
    Unknown { kind: String },
}

impl SessionEvent {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Mode { .. } => "mode",
            Self::StepIndex { .. } => "step_index",
            Self::StepsDone { .. } => "step_done_marker",
            Self::AnalysisResult { .. } => "result",
            Self::Snapshot(_) => "state",
            Self::StepStarted { .. } => "step_start",
            Self::StepCompleted { .. } => "step_complete",
            Self::Output(_) => "output",
            Self::ApprovalRequired(_) => "approval_required",
            Self::ApprovalResponded { .. } => "approval_response",
            Self::StatusChanged(_) => "status_change",
            Self::Completed { .. } => "complete",
            Self::Failed { .. } => "error",
            Self::Keepalive => "ping",
            Self::Unknown { kind } => kind,
        }
    }

    /// Snapshot-class events replace state wholesale and bypass the
    /// terminal-state guard.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::Snapshot(_) | Self::Mode { .. })
    }

    /// Events that put the session into a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed { .. } | Self::AnalysisResult { .. } | Self::Failed { .. } => true,
            Self::StatusChanged(status) => status.is_terminal(),
            _ => false,
        }
    }
}
