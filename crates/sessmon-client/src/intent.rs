//! Optimistic command intents.
//!
//! A command takes effect in the published view as soon as it is issued,
//! before the backend confirms it. The ledger keeps those intents apart from
//! the reduced session: the authoritative state is never edited, an overlay
//! is computed on top of it for each publication. When the backend reports
//! the outcome the intent is dropped and the authoritative state shows
//! through, whatever it says.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use sessmon_core::{Session, SessionEvent, SessionStatus};
use sessmon_protocol::{ControlAction, OutboundCommand};

// ============================================================================
// Commands
// ============================================================================

/// User-issued action on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Pause,
    Resume,
    Stop,
    Approve,
    Reject,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    /// Lifecycle actions go to the control endpoint.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Pause | Self::Resume | Self::Stop)
    }

    /// Status the session shows while the intent is unconfirmed.
    #[must_use]
    pub fn optimistic_status(&self) -> SessionStatus {
        match self {
            Self::Pause => SessionStatus::Paused,
            Self::Stop => SessionStatus::Stopped,
            Self::Resume | Self::Approve | Self::Reject => SessionStatus::Running,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action plus the optional free-text response of approval decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub action: CommandAction,
    pub response: Option<String>,
}

impl Command {
    pub fn pause() -> Self {
        Self::bare(CommandAction::Pause)
    }

    pub fn resume() -> Self {
        Self::bare(CommandAction::Resume)
    }

    pub fn stop() -> Self {
        Self::bare(CommandAction::Stop)
    }

    pub fn approve(response: Option<String>) -> Self {
        Self {
            action: CommandAction::Approve,
            response,
        }
    }

    pub fn reject(response: Option<String>) -> Self {
        Self {
            action: CommandAction::Reject,
            response,
        }
    }

    fn bare(action: CommandAction) -> Self {
        Self {
            action,
            response: None,
        }
    }

    /// Wire request for this command.
    pub fn to_outbound(&self) -> OutboundCommand {
        match self.action {
            CommandAction::Pause => OutboundCommand::control(ControlAction::Pause),
            CommandAction::Resume => OutboundCommand::control(ControlAction::Resume),
            CommandAction::Stop => OutboundCommand::control(ControlAction::Stop),
            CommandAction::Approve => OutboundCommand::approval(true, self.response.clone()),
            CommandAction::Reject => OutboundCommand::approval(false, self.response.clone()),
        }
    }
}

// ============================================================================
// Intent Ledger
// ============================================================================

/// A command awaiting confirmation from the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandIntent {
    pub id: u64,
    pub action: CommandAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub confirmed: bool,
    /// No confirmation arrived in time, or the request failed. Still
    /// overlaid until confirmed or rolled back.
    pub expired: bool,
}

/// Unconfirmed intents in issue order.
#[derive(Debug, Default)]
pub struct IntentLedger {
    next_id: u64,
    intents: Vec<CommandIntent>,
}

impl IntentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new intent and returns its id.
    pub fn issue(&mut self, command: &Command, at: DateTime<Utc>) -> u64 {
        self.next_id = self.next_id.saturating_add(1);
        let id = self.next_id;
        self.intents.push(CommandIntent {
            id,
            action: command.action,
            response: command.response.clone(),
            issued_at: at,
            confirmed: false,
            expired: false,
        });
        id
    }

    /// Removes every intent `event` settles and returns their ids.
    ///
    /// Snapshots, terminal events, status changes and new approval requests
    /// are authoritative and settle every pending intent. An approval
    /// response also settles approval intents.
    pub fn reconcile(&mut self, event: &SessionEvent) -> Vec<u64> {
        let settles_all = event.is_snapshot()
            || event.is_terminal()
            || matches!(
                event,
                SessionEvent::StatusChanged(_) | SessionEvent::ApprovalRequired(_)
            );
        let settles_approval =
            settles_all || matches!(event, SessionEvent::ApprovalResponded { .. });

        let mut confirmed = Vec::new();
        self.intents.retain_mut(|intent| {
            let hit = if intent.action.is_control() {
                settles_all
            } else {
                settles_approval
            };
            if hit {
                intent.confirmed = true;
                confirmed.push(intent.id);
            }
            !hit
        });
        confirmed
    }

    /// Marks an intent expired. Returns false if it is no longer pending.
    pub fn expire(&mut self, id: u64) -> bool {
        match self.intents.iter_mut().find(|i| i.id == id) {
            Some(intent) if !intent.expired => {
                intent.expired = true;
                true
            }
            _ => false,
        }
    }

    /// Drops expired intents, restoring the authoritative view for them.
    pub fn discard_expired(&mut self) -> usize {
        let before = self.intents.len();
        self.intents.retain(|i| !i.expired);
        before - self.intents.len()
    }

    /// Authoritative session with pending intents applied in issue order.
    ///
    /// A terminal authoritative status is never overridden.
    pub fn overlay(&self, authoritative: &Session) -> Session {
        let mut view = authoritative.clone();
        if authoritative.is_terminal() {
            return view;
        }
        for intent in &self.intents {
            view.status = intent.action.optimistic_status();
            if !intent.action.is_control() {
                view.pending_approval = None;
            }
        }
        view
    }

    pub fn pending(&self) -> &[CommandIntent] {
        &self.intents
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}
