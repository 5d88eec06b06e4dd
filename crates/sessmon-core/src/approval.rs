//! Approval requests raised by an executing agent.

use serde::{Deserialize, Serialize};

/// Kind of decision the backend is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    #[default]
    Confirmation,
    Choice,
    Input,
}

/// An outstanding approval request. At most one exists per session; a newer
/// request replaces the previous one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ApprovalKind,
    pub title: String,
    pub description: String,
    /// Choices offered for `choice` requests; kept verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<String>,
}
