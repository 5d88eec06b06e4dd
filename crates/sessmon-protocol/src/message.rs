//! Outbound request bodies for the control and approval endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle action sent to `POST /control/{session_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

/// Body of `POST /approve/{session_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// A request the client sends on behalf of the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    Control(ControlRequest),
    Approval(ApprovalDecision),
}

impl OutboundCommand {
    pub fn control(action: ControlAction) -> Self {
        Self::Control(ControlRequest { action })
    }

    pub fn approval(approved: bool, response: Option<String>) -> Self {
        Self::Approval(ApprovalDecision { approved, response })
    }

    /// Path segment of the endpoint this command is posted to.
    #[must_use]
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Control(_) => "control",
            Self::Approval(_) => "approve",
        }
    }

    /// JSON body of the request.
    pub fn body(&self) -> serde_json::Value {
        // Both bodies are plain structs of strings and bools.
        let body = match self {
            Self::Control(req) => serde_json::to_value(req),
            Self::Approval(decision) => serde_json::to_value(decision),
        };
        body.unwrap_or(serde_json::Value::Null)
    }

    /// Short label used in logs and errors.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Control(req) => req.action.as_str(),
            Self::Approval(ApprovalDecision { approved: true, .. }) => "approve",
            Self::Approval(_) => "reject",
        }
    }
}
