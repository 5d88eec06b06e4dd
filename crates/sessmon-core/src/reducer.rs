//! Session reducer: folds one [`SessionEvent`] into a [`Session`].
//!
//! `apply` is total: it never panics and never fails. Events that make no
//! sense for the current state are reported as [`Anomaly`] values and logged,
//! and the reducer either ignores them or merges them on a best-effort basis.
//! The backend is authoritative, so a surprising event is applied where doing
//! so keeps the invariants:
//!
//! - at most one step is `running`;
//! - steps are append-only and never reordered;
//! - once the session is terminal, only snapshot events change it.
//!
//! The only side effect is `tracing` output.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    AnalysisStepStatus, ApprovalRequest, OutputLine, Session, SessionEvent, SessionId,
    SessionStatus, Step, StepStatus,
};

/// Upper bound on the number of steps a session may hold.
pub const MAX_STEPS: usize = 1024;

// ============================================================================
// Reduction Outcome
// ============================================================================

/// A semantically unexpected but well-formed event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    #[error("{kind} event after terminal status {status}")]
    AfterTerminal { kind: String, status: SessionStatus },

    #[error("step {new} started while {previous} was still running")]
    OverlappingStep { previous: String, new: String },

    #[error("step_start reuses id {id} of a finished step")]
    RepeatedStepId { id: String },

    #[error("step_complete with no running step")]
    NoRunningStep,

    #[error("step {step} is outside the {known} known steps")]
    StepOutOfRange { step: usize, known: usize },

    #[error("illegal transition for step {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("mode announced {requested} steps, capped at {limit}")]
    StepLimit { requested: usize, limit: usize },

    #[error("snapshot contained {count} running steps")]
    MultipleRunning { count: usize },
}

/// What a single `apply` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reduction {
    /// Whether the session differs from before the event.
    pub changed: bool,
    pub anomalies: Vec<Anomaly>,
}

impl Reduction {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed() -> Self {
        Self {
            changed: true,
            anomalies: Vec::new(),
        }
    }

    fn with(mut self, anomaly: Anomaly) -> Self {
        self.anomalies.push(anomaly);
        self
    }

    fn push(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
    }

    /// Returns true if no anomaly was recorded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Applies one event to the session.
pub fn apply(session: &mut Session, event: SessionEvent) -> Reduction {
    if session.status.is_terminal() && !event.is_snapshot() {
        if matches!(event, SessionEvent::Keepalive) {
            return Reduction::unchanged();
        }
        let reduction = Reduction::unchanged().with(Anomaly::AfterTerminal {
            kind: event.kind().to_string(),
            status: session.status,
        });
        log_anomalies(&session.id, &reduction);
        return reduction;
    }

    let reduction = match event {
        SessionEvent::Mode {
            mode,
            total_steps,
            labels,
        } => handle_mode(session, mode, total_steps, labels),
        SessionEvent::StepIndex {
            step,
            status,
            detail,
            proof,
            at,
        } => handle_step_index(session, step, status, detail, proof, at),
        SessionEvent::StepsDone { at } => handle_steps_done(session, at),
        SessionEvent::AnalysisResult { report, at } => {
            session.validation_status = report
                .get("validationStatus")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            handle_completed(session, Some(report), at)
        }
        SessionEvent::Snapshot(snapshot) => handle_snapshot(session, *snapshot),
        SessionEvent::StepStarted {
            id,
            name,
            description,
            at,
        } => handle_step_started(session, id, name, description, at),
        SessionEvent::StepCompleted { result, at } => handle_step_completed(session, result, at),
        SessionEvent::Output(line) => handle_output(session, line),
        SessionEvent::ApprovalRequired(request) => handle_approval_required(session, request),
        SessionEvent::ApprovalResponded { approved, .. } => {
            debug!(session_id = %session.id, ?approved, "Approval resolved");
            session.pending_approval = None;
            session.status = SessionStatus::Running;
            Reduction::changed()
        }
        SessionEvent::StatusChanged(status) => {
            if session.status == status {
                Reduction::unchanged()
            } else {
                debug!(
                    session_id = %session.id,
                    from = %session.status,
                    to = %status,
                    "Status changed by backend"
                );
                session.status = status;
                Reduction::changed()
            }
        }
        SessionEvent::Completed { result, at } => handle_completed(session, result, at),
        SessionEvent::Failed { error, at } => handle_failed(session, error, at),
        SessionEvent::Keepalive => Reduction::unchanged(),
        SessionEvent::Unknown { kind } => {
            debug!(session_id = %session.id, kind = %kind, "Ignoring unknown event");
            Reduction::unchanged()
        }
    };

    log_anomalies(&session.id, &reduction);
    reduction
}

/// Folds a sequence of events into a fresh session.
pub fn fold<I>(id: SessionId, events: I) -> Session
where
    I: IntoIterator<Item = SessionEvent>,
{
    let mut session = Session::new(id);
    for event in events {
        apply(&mut session, event);
    }
    session
}

fn log_anomalies(id: &SessionId, reduction: &Reduction) {
    for anomaly in &reduction.anomalies {
        warn!(session_id = %id, %anomaly, "Protocol anomaly");
    }
}

// ============================================================================
// Snapshot Handlers
// ============================================================================

fn handle_mode(
    session: &mut Session,
    mode: String,
    total_steps: usize,
    labels: Vec<String>,
) -> Reduction {
    let requested = total_steps.max(labels.len());
    let count = requested.min(MAX_STEPS);
    let mut labels = labels.into_iter();
    let steps = (1..=count)
        .map(|n| {
            let name = labels.next().unwrap_or_else(|| format!("Step {n}"));
            Step::new(analysis_step_id(n), name)
        })
        .collect();

    *session = Session {
        id: session.id.clone(),
        status: SessionStatus::Running,
        steps,
        mode: Some(mode),
        total_steps: Some(count),
        ..Session::default()
    };

    let reduction = Reduction::changed();
    if requested > count {
        return reduction.with(Anomaly::StepLimit {
            requested,
            limit: MAX_STEPS,
        });
    }
    reduction
}

fn handle_snapshot(session: &mut Session, mut snapshot: Session) -> Reduction {
    let mut reduction = Reduction::changed();

    if snapshot.id.is_empty() {
        snapshot.id = session.id.clone();
    }

    let running = snapshot.running_steps();
    if running > 1 {
        let mut seen = 0;
        for step in snapshot
            .steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::Running)
        {
            seen += 1;
            if seen < running {
                step.status = StepStatus::Skipped;
            }
        }
        reduction.push(Anomaly::MultipleRunning { count: running });
    }

    if snapshot.current_step_id.is_none() {
        snapshot.current_step_id = snapshot
            .steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Running)
            .map(|s| s.id.clone());
    }

    *session = snapshot;
    reduction
}

// ============================================================================
// Analysis Step Handlers
// ============================================================================

fn analysis_step_id(n: usize) -> String {
    format!("step-{n}")
}

fn handle_step_index(
    session: &mut Session,
    step: usize,
    status: AnalysisStepStatus,
    detail: Option<String>,
    proof: Option<String>,
    at: DateTime<Utc>,
) -> Reduction {
    if step == 0 || step > MAX_STEPS {
        return Reduction::unchanged().with(Anomaly::StepOutOfRange {
            step,
            known: session.steps.len(),
        });
    }

    let mut reduction = Reduction::unchanged();
    let known = session.steps.len();
    if step > known {
        reduction.push(Anomaly::StepOutOfRange { step, known });
        for n in known + 1..=step {
            session.steps.push(Step::new(analysis_step_id(n), format!("Step {n}")));
        }
        session.total_steps = Some(session.total_steps.unwrap_or(0).max(step));
        reduction.changed = true;
    }

    let index = step - 1;
    let target = match status {
        AnalysisStepStatus::Pending => StepStatus::Pending,
        AnalysisStepStatus::Running => StepStatus::Running,
        AnalysisStepStatus::Complete => StepStatus::Completed,
        AnalysisStepStatus::Failed => StepStatus::Error,
    };

    if target == StepStatus::Running {
        // Analysis steps only move forward: a newer running step finishes the old one.
        for (i, other) in session.steps.iter_mut().enumerate() {
            if i != index && other.status == StepStatus::Running {
                other.finish(StepStatus::Completed, at);
                reduction.changed = true;
            }
        }
    }

    let Some(entry) = session.steps.get_mut(index) else {
        return reduction;
    };

    let transitioned = if entry.status == target {
        true
    } else if target == StepStatus::Running {
        entry.start(at)
    } else if target == StepStatus::Pending {
        false
    } else {
        entry.finish(target, at)
    };

    if !transitioned {
        reduction.push(Anomaly::IllegalTransition {
            id: entry.id.clone(),
            from: entry.status,
            to: target,
        });
        return reduction;
    }

    if detail.is_some() {
        entry.detail = detail;
    }
    if proof.is_some() {
        entry.proof = proof;
    }
    if target == StepStatus::Error {
        entry.error = Some(
            entry
                .detail
                .clone()
                .unwrap_or_else(|| "step failed".to_string()),
        );
    }
    reduction.changed = true;

    let entry_id = entry.id.clone();
    if target == StepStatus::Running {
        session.current_step_id = Some(entry_id);
        if session.status == SessionStatus::Idle {
            session.status = SessionStatus::Running;
        }
    } else if session.current_step_id.as_deref() == Some(entry_id.as_str()) && target.is_terminal()
    {
        session.current_step_id = None;
    }

    reduction
}

fn handle_steps_done(session: &mut Session, at: DateTime<Utc>) -> Reduction {
    let mut reduction = Reduction::unchanged();
    for step in session.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
        step.finish(StepStatus::Completed, at);
        reduction.changed = true;
    }
    if session.current_step_id.take().is_some() {
        reduction.changed = true;
    }
    reduction
}

// ============================================================================
// Execution Handlers
// ============================================================================

fn handle_step_started(
    session: &mut Session,
    id: String,
    name: String,
    description: Option<String>,
    at: DateTime<Utc>,
) -> Reduction {
    let mut reduction = Reduction::changed();

    if let Some(previous) = session
        .steps
        .iter_mut()
        .rev()
        .find(|s| s.status == StepStatus::Running)
    {
        reduction.push(Anomaly::OverlappingStep {
            previous: previous.id.clone(),
            new: id.clone(),
        });
        previous.finish(StepStatus::Skipped, at);
    }

    if session
        .steps
        .iter()
        .any(|s| s.id == id && s.status.is_terminal())
    {
        reduction.push(Anomaly::RepeatedStepId { id: id.clone() });
    }

    let mut step = Step::new(id.clone(), name);
    step.description = description;
    step.start(at);
    session.steps.push(step);
    session.current_step_id = Some(id);

    if session.status == SessionStatus::Idle {
        session.status = SessionStatus::Running;
    }
    reduction
}

fn handle_step_completed(
    session: &mut Session,
    result: Option<serde_json::Value>,
    at: DateTime<Utc>,
) -> Reduction {
    // Position-based: the last appended step, never an id lookup.
    match session.steps.last_mut() {
        Some(step) if step.status == StepStatus::Running => {
            step.finish(StepStatus::Completed, at);
            step.result = result;
            session.current_step_id = None;
            Reduction::changed()
        }
        _ => Reduction::unchanged().with(Anomaly::NoRunningStep),
    }
}

fn handle_output(session: &mut Session, line: OutputLine) -> Reduction {
    session.output.push(line);
    Reduction::changed()
}

fn handle_approval_required(session: &mut Session, request: ApprovalRequest) -> Reduction {
    if let Some(previous) = &session.pending_approval {
        debug!(
            session_id = %session.id,
            superseded = %previous.id,
            replacement = %request.id,
            "Replacing pending approval"
        );
    }
    session.pending_approval = Some(request);
    session.status = SessionStatus::WaitingApproval;
    Reduction::changed()
}

// ============================================================================
// Terminal Handlers
// ============================================================================

fn finish_running_step(
    session: &mut Session,
    status: StepStatus,
    at: DateTime<Utc>,
) -> Option<&mut Step> {
    let step = session
        .steps
        .iter_mut()
        .rev()
        .find(|s| s.status == StepStatus::Running)?;
    step.finish(status, at);
    session.current_step_id = None;
    Some(step)
}

fn handle_completed(
    session: &mut Session,
    result: Option<serde_json::Value>,
    at: DateTime<Utc>,
) -> Reduction {
    finish_running_step(session, StepStatus::Completed, at);
    session.status = SessionStatus::Completed;
    session.completed_at = Some(at);
    if result.is_some() {
        session.result = result;
    }
    Reduction::changed()
}

fn handle_failed(session: &mut Session, error: String, at: DateTime<Utc>) -> Reduction {
    if let Some(step) = finish_running_step(session, StepStatus::Error, at) {
        step.error = Some(error.clone());
    }
    session.status = SessionStatus::Error;
    session.error = Some(error);
    session.completed_at = Some(at);
    Reduction::changed()
}

// ============================================================================
// Tests
// ============================================================================
