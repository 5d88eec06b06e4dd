//! Envelope parsing: JSON frame payloads to typed session events.
//!
//! Two payload families share one stream format:
//!
//! - analysis flows send `{type: "mode" | "result" | "error"}` envelopes and
//!   untyped step frames `{step: n, status, detail?, proof?}` plus the
//!   `{step: "done"}` sentinel;
//! - execution flows send `{type: ...}` envelopes from a fixed vocabulary.
//!
//! Anything with an unrecognized `type` becomes [`SessionEvent::Unknown`] so
//! backend additions degrade to no-ops.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use sessmon_core::{
    AnalysisStepStatus, ApprovalRequest, DomainError, OutputLevel, OutputLine, Session,
    SessionEvent, SessionId, SessionStatus, Step, StepStatus,
};

use crate::frame::Frame;

/// Errors produced while classifying a payload.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Invalid {kind} event: {reason}")]
    InvalidEvent { kind: String, reason: String },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl EnvelopeError {
    fn invalid(kind: &str, reason: impl ToString) -> Self {
        Self::InvalidEvent {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Parses a decoded frame. A JSON payload without `type` falls back to the
/// SSE event name unless that name is the default `message`.
pub fn parse_frame(
    frame: &Frame,
    received_at: DateTime<Utc>,
) -> Result<SessionEvent, EnvelopeError> {
    let hint = frame.event.as_deref().filter(|e| *e != "message");
    parse_with_hint(&frame.data, hint, received_at)
}

/// Parses a bare payload string.
pub fn parse_payload(
    data: &str,
    received_at: DateTime<Utc>,
) -> Result<SessionEvent, EnvelopeError> {
    parse_with_hint(data, None, received_at)
}

fn parse_with_hint(
    data: &str,
    hint: Option<&str>,
    received_at: DateTime<Utc>,
) -> Result<SessionEvent, EnvelopeError> {
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("ping") {
        return Ok(SessionEvent::Keepalive);
    }

    let value: Value = serde_json::from_str(trimmed)?;
    classify_with_hint(value, hint, received_at)
}

/// Classifies an already parsed JSON payload.
pub fn classify(value: Value, received_at: DateTime<Utc>) -> Result<SessionEvent, EnvelopeError> {
    classify_with_hint(value, None, received_at)
}

fn classify_with_hint(
    value: Value,
    hint: Option<&str>,
    received_at: DateTime<Utc>,
) -> Result<SessionEvent, EnvelopeError> {
    let Value::Object(map) = value else {
        return Err(EnvelopeError::NotAnObject);
    };

    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| hint.map(str::to_string));

    match kind {
        Some(kind) => classify_typed(&kind, map, received_at),
        None => classify_step_frame(&map, received_at),
    }
}

// ============================================================================
// Typed Envelopes
// ============================================================================

fn classify_typed(
    kind: &str,
    mut map: Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Result<SessionEvent, EnvelopeError> {
    let at = timestamp(&map, received_at);

    let event = match kind {
        "ping" | "heartbeat" | "keepalive" => SessionEvent::Keepalive,

        "mode" => {
            let raw: RawMode = from_map(kind, map)?;
            let labels: Vec<String> = raw.steps.iter().filter_map(label_of).collect();
            SessionEvent::Mode {
                mode: raw.mode.unwrap_or_default(),
                total_steps: raw.total_steps.unwrap_or(labels.len()),
                labels,
            }
        }

        "result" => SessionEvent::AnalysisResult {
            report: map
                .remove("report")
                .unwrap_or_else(|| Value::Object(Map::new())),
            at,
        },

        "error" => {
            let raw: RawError = from_map(kind, map)?;
            SessionEvent::Failed {
                error: raw
                    .error
                    .or(raw.message)
                    .unwrap_or_else(|| "unknown error".to_string()),
                at,
            }
        }

        "state" => {
            let body = map
                .remove("data")
                .or_else(|| map.remove("session"))
                .unwrap_or(Value::Object(map));
            let raw: RawSnapshot = serde_json::from_value(body)
                .map_err(|e| EnvelopeError::invalid(kind, e))?;
            SessionEvent::Snapshot(Box::new(raw.into_session(received_at)?))
        }

        "step_start" => {
            let body = match map.remove("step") {
                Some(step @ Value::Object(_)) => step,
                _ => Value::Object(map),
            };
            let raw: RawStep = serde_json::from_value(body)
                .map_err(|e| EnvelopeError::invalid(kind, e))?;
            let id = raw
                .id
                .as_ref()
                .and_then(id_string)
                .or_else(|| raw.name.clone())
                .ok_or_else(|| EnvelopeError::invalid(kind, "step has neither id nor name"))?;
            SessionEvent::StepStarted {
                name: raw.name.unwrap_or_else(|| id.clone()),
                id,
                description: raw.description,
                at,
            }
        }

        "step_complete" => {
            let result = map.remove("result").or_else(|| {
                map.get_mut("step")
                    .and_then(Value::as_object_mut)
                    .and_then(|s| s.remove("result"))
            });
            SessionEvent::StepCompleted { result, at }
        }

        "output" => {
            let raw: RawOutput = from_map(kind, map)?;
            SessionEvent::Output(raw.into_line(at))
        }

        "approval_required" => {
            let body = map
                .remove("request")
                .or_else(|| map.remove("approval"))
                .or_else(|| map.remove("data"))
                .ok_or_else(|| EnvelopeError::invalid(kind, "missing request"))?;
            let request: ApprovalRequest = serde_json::from_value(body)
                .map_err(|e| EnvelopeError::invalid(kind, e))?;
            SessionEvent::ApprovalRequired(request)
        }

        "approval_response" => {
            let raw: RawApprovalResponse = from_map(kind, map)?;
            SessionEvent::ApprovalResponded {
                approved: raw.approved,
                response: raw.response,
            }
        }

        "status_change" => {
            let status = map
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| EnvelopeError::invalid(kind, "missing status"))?;
            SessionEvent::StatusChanged(status.parse::<SessionStatus>()?)
        }

        "complete" => SessionEvent::Completed {
            result: map.remove("result"),
            at,
        },

        other => SessionEvent::Unknown {
            kind: other.to_string(),
        },
    };

    Ok(event)
}

// ============================================================================
// Untyped Analysis Step Frames
// ============================================================================

fn classify_step_frame(
    map: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Result<SessionEvent, EnvelopeError> {
    let at = timestamp(map, received_at);
    let status = map.get("status").and_then(Value::as_str);

    match map.get("step") {
        Some(Value::String(s)) if s == "done" => Ok(SessionEvent::StepsDone { at }),
        Some(Value::Number(_)) if status == Some("done") => Ok(SessionEvent::StepsDone { at }),
        Some(Value::Number(n)) => {
            let step = n
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| EnvelopeError::invalid("step", format!("bad step number {n}")))?;
            let status = match status {
                Some("pending") => AnalysisStepStatus::Pending,
                Some("running") => AnalysisStepStatus::Running,
                Some("complete" | "completed") => AnalysisStepStatus::Complete,
                Some("failed" | "error") => AnalysisStepStatus::Failed,
                other => {
                    return Err(EnvelopeError::invalid(
                        "step",
                        format!("unknown status {}", other.unwrap_or("<missing>")),
                    ))
                }
            };
            Ok(SessionEvent::StepIndex {
                step,
                status,
                detail: map.get("detail").and_then(Value::as_str).map(str::to_string),
                proof: map.get("proof").and_then(Value::as_str).map(str::to_string),
                at,
            })
        }
        _ => Ok(SessionEvent::Unknown {
            kind: "untyped".to_string(),
        }),
    }
}

// ============================================================================
// Raw Payload Shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMode {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default, alias = "total_steps")]
    total_steps: Option<usize>,
    #[serde(default)]
    steps: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default, alias = "message", alias = "text")]
    content: String,
    #[serde(default)]
    level: Option<String>,
}

impl RawOutput {
    fn into_line(self, at: DateTime<Utc>) -> OutputLine {
        let level = self
            .level
            .as_deref()
            .map(OutputLevel::from_wire)
            .unwrap_or_default();
        OutputLine::new(at, self.content, level)
    }
}

#[derive(Debug, Deserialize)]
struct RawApprovalResponse {
    #[serde(default)]
    approved: Option<bool>,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawStep {
    id: Option<Value>,
    #[serde(alias = "title", alias = "label")]
    name: Option<String>,
    description: Option<String>,
    status: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    result: Option<Value>,
    error: Option<String>,
    detail: Option<String>,
    proof: Option<String>,
}

impl RawStep {
    fn into_step(self, position: usize) -> Result<Step, EnvelopeError> {
        let id = self
            .id
            .as_ref()
            .and_then(id_string)
            .unwrap_or_else(|| format!("step-{position}"));
        let status = match self.status.as_deref() {
            None => StepStatus::Pending,
            Some(s) => parse_step_status(s)?,
        };
        Ok(Step {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            description: self.description,
            status,
            started_at: self.started_at.as_deref().and_then(parse_time),
            completed_at: self.completed_at.as_deref().and_then(parse_time),
            result: self.result,
            error: self.error,
            detail: self.detail,
            proof: self.proof,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawOutputLine {
    timestamp: Option<String>,
    #[serde(alias = "message", alias = "text")]
    content: String,
    level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawSnapshot {
    id: Option<Value>,
    status: Option<String>,
    steps: Vec<RawStep>,
    #[serde(alias = "currentStepId")]
    current_step: Option<Value>,
    output: Vec<RawOutputLine>,
    pending_approval: Option<ApprovalRequest>,
    result: Option<Value>,
    error: Option<String>,
    mode: Option<String>,
    total_steps: Option<usize>,
    validation_status: Option<String>,
    completed_at: Option<String>,
}

impl RawSnapshot {
    fn into_session(self, received_at: DateTime<Utc>) -> Result<Session, EnvelopeError> {
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.into_step(i + 1))
            .collect::<Result<Vec<_>, _>>()?;

        // currentStep may be an id, a position, or a step object.
        let current_step_id = match self.current_step {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .and_then(|i| steps.get(i))
                .map(|s| s.id.clone()),
            Some(Value::Object(obj)) => obj.get("id").and_then(id_string),
            Some(other) => id_string(&other),
            None => None,
        };

        let output = self
            .output
            .into_iter()
            .map(|line| {
                let at = line.timestamp.as_deref().and_then(parse_time).unwrap_or(received_at);
                let level = line.level.as_deref().map(OutputLevel::from_wire).unwrap_or_default();
                OutputLine::new(at, line.content, level)
            })
            .collect();

        Ok(Session {
            id: SessionId::new(self.id.as_ref().and_then(id_string).unwrap_or_default()),
            status: match self.status.as_deref() {
                Some(s) => s.parse()?,
                None => SessionStatus::Running,
            },
            steps,
            current_step_id,
            output,
            pending_approval: self.pending_approval,
            result: self.result,
            error: self.error,
            mode: self.mode,
            total_steps: self.total_steps,
            validation_status: self.validation_status,
            completed_at: self.completed_at.as_deref().and_then(parse_time),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn from_map<T: serde::de::DeserializeOwned>(
    kind: &str,
    map: Map<String, Value>,
) -> Result<T, EnvelopeError> {
    serde_json::from_value(Value::Object(map)).map_err(|e| EnvelopeError::invalid(kind, e))
}

fn parse_step_status(s: &str) -> Result<StepStatus, EnvelopeError> {
    match s {
        "pending" => Ok(StepStatus::Pending),
        "running" => Ok(StepStatus::Running),
        "completed" | "complete" => Ok(StepStatus::Completed),
        "error" | "failed" => Ok(StepStatus::Error),
        "skipped" => Ok(StepStatus::Skipped),
        other => Err(DomainError::invalid(
            "step status",
            other,
            "pending, running, completed, error or skipped",
        )
        .into()),
    }
}

/// Accepts string or numeric ids.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn label_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => ["label", "name", "title"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn timestamp(map: &Map<String, Value>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    map.get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_time)
        .unwrap_or(fallback)
}
