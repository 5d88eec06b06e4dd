//! Output lines streamed by a running session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
    Success,
    Debug,
}

impl OutputLevel {
    /// Parses a wire level, falling back to `Info` for anything unknown.
    pub fn from_wire(level: &str) -> Self {
        match level {
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "success" => Self::Success,
            "debug" => Self::Debug,
            _ => Self::Info,
        }
    }
}

/// One line of session output. Immutable once appended.
///
/// The timestamp is backend-assigned and may not be monotonic; ordering is
/// arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub level: OutputLevel,
}

impl OutputLine {
    pub fn new(timestamp: DateTime<Utc>, content: impl Into<String>, level: OutputLevel) -> Self {
        Self {
            timestamp,
            content: content.into(),
            level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_wire() {
        assert_eq!(OutputLevel::from_wire("warning"), OutputLevel::Warn);
        assert_eq!(OutputLevel::from_wire("success"), OutputLevel::Success);
        assert_eq!(OutputLevel::from_wire("trace"), OutputLevel::Info);
    }
}
