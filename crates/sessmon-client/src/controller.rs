//! Streaming session controller.
//!
//! One actor task per open session owns the connection, the reduced
//! [`Session`] and the [`IntentLedger`]. Handles talk to it over an `mpsc`
//! command channel with `oneshot` replies and observe it through a `watch`
//! channel carrying [`SessionSnapshot`]s.
//!
//! The actor reads one frame at a time: decode, parse, reduce, publish, and
//! only then read the next frame. Connection drops are retried with
//! exponential backoff while the last known state stays visible (stale).
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sessmon_core::{apply, Session, SessionEvent, SessionId};
use sessmon_protocol::{parse_frame, Frame};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::intent::{Command, CommandIntent, IntentLedger};
use crate::transport::{FrameStream, SessionTransport};

/// Capacity of the handle-to-actor command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Error recorded when reconnecting gives up.
pub const RECONNECT_EXHAUSTED: &str = "reconnect attempts exhausted";

// ============================================================================
// Published State
// ============================================================================

/// Connection lifecycle as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// The stream dropped; state is kept but stale.
    Reconnecting { attempt: u32 },
    /// A terminal event arrived; the stream is no longer read.
    Finished,
    Failed { reason: String },
}

/// What consumers observe after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Strictly increases with every publication.
    pub revision: u64,
    pub connection: ConnectionState,
    /// Reduced state with unconfirmed intents overlaid.
    pub session: Session,
    pub intents: Vec<CommandIntent>,
}

impl SessionSnapshot {
    fn initial(session_id: SessionId) -> Self {
        Self {
            revision: 0,
            connection: ConnectionState::Connecting,
            session: Session::new(session_id),
            intents: Vec::new(),
        }
    }

    /// True while the connection is being re-established.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self.connection, ConnectionState::Reconnecting { .. })
    }
}

/// Result of a delivered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A confirming event arrived within the ack timeout.
    Acknowledged,
    /// No confirmation in time. The intent stays overlaid, marked expired.
    Unconfirmed,
}

// ============================================================================
// Actor Commands
// ============================================================================

#[derive(Debug)]
struct IssuedIntent {
    id: u64,
    confirmation: oneshot::Receiver<()>,
}

#[derive(Debug)]
enum ActorCommand {
    /// Record an intent and publish the optimistic overlay.
    Issue {
        command: Command,
        respond_to: oneshot::Sender<Result<IssuedIntent>>,
    },

    /// Stop waiting for confirmation of an intent.
    Expire { intent_id: u64 },

    /// Drop expired intents.
    Rollback { respond_to: oneshot::Sender<usize> },
}

// ============================================================================
// Controller
// ============================================================================

/// Opens and closes the monitored session.
///
/// At most one session is open per controller. Opening the same id again
/// returns the existing handle without a second connection.
pub struct SessionController {
    config: Arc<ClientConfig>,
    transport: Arc<dyn SessionTransport>,
    current: Mutex<Option<SessionHandle>>,
}

impl SessionController {
    pub fn new(config: ClientConfig, transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            current: Mutex::new(None),
        }
    }

    /// Starts monitoring `session_id`.
    ///
    /// # Errors
    ///
    /// - `ClientError::AlreadyOpen` if a different session is still open
    pub async fn open(&self, session_id: impl Into<SessionId>) -> Result<SessionHandle> {
        let session_id = session_id.into();
        let mut current = self.current.lock().await;

        if let Some(handle) = current.as_ref().filter(|h| !h.is_closed()) {
            if handle.session_id == session_id {
                debug!(session_id = %session_id, "Session already open");
                return Ok(handle.clone());
            }
            return Err(ClientError::AlreadyOpen {
                current: handle.session_id.clone(),
            });
        }

        let handle = spawn_session(
            session_id,
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
        );
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Closes the open session, if any. Idempotent.
    pub async fn close(&self) {
        if let Some(handle) = self.current.lock().await.take() {
            handle.close();
        }
    }

    /// Handle of the open session.
    pub async fn current(&self) -> Option<SessionHandle> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|h| !h.is_closed())
            .cloned()
    }
}

fn spawn_session(
    session_id: SessionId,
    config: Arc<ClientConfig>,
    transport: Arc<dyn SessionTransport>,
) -> SessionHandle {
    let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (publisher, state) = watch::channel(SessionSnapshot::initial(session_id.clone()));
    let cancel = CancellationToken::new();

    let actor = SessionActor {
        session: Session::new(session_id.clone()),
        session_id: session_id.clone(),
        config: Arc::clone(&config),
        transport: Arc::clone(&transport),
        receiver,
        publisher,
        cancel: cancel.clone(),
        ledger: IntentLedger::new(),
        waiters: HashMap::new(),
        connection: ConnectionState::Connecting,
        revision: 0,
        last_event_id: None,
        failures: 0,
        delay: config.retry_initial_delay,
    };
    tokio::spawn(actor.run());

    SessionHandle {
        session_id,
        sender,
        state,
        cancel,
        transport,
        ack_timeout: config.command_ack_timeout,
    }
}

// ============================================================================
// Session Handle
// ============================================================================

/// Cheap-to-clone handle to one monitored session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    sender: mpsc::Sender<ActorCommand>,
    state: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    transport: Arc<dyn SessionTransport>,
    ack_timeout: Duration,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// New receiver of published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Waits for the first snapshot matching `predicate`, including the
    /// current one.
    ///
    /// # Errors
    ///
    /// - `ClientError::Closed` if the session closes first
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.state.clone();
        let found = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(found.clone())
    }

    /// Issues a command with an optimistic overlay.
    ///
    /// The overlay is published before the request is sent. The call then
    /// waits up to `command_ack_timeout` for a confirming event.
    ///
    /// # Errors
    ///
    /// - `ClientError::SessionEnded` if the session is already terminal
    /// - `ClientError::CommandFailed` if the request could not be delivered;
    ///   the intent stays overlaid until confirmed or rolled back
    /// - `ClientError::Closed` if the session was closed
    pub async fn issue_command(&self, command: Command) -> Result<CommandOutcome> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorCommand::Issue {
                command: command.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        let issued = rx.await.map_err(|_| ClientError::Closed)??;

        let outbound = command.to_outbound();
        let sent = tokio::select! {
            result = self.transport.send(&self.session_id, &outbound) => result,
            _ = self.cancel.cancelled() => return Err(ClientError::Closed),
        };
        if let Err(e) = sent {
            warn!(
                session_id = %self.session_id,
                command = %command.action,
                error = %e,
                "Command request failed"
            );
            self.expire(issued.id).await;
            return Err(ClientError::CommandFailed {
                action: command.action.to_string(),
                reason: e.to_string(),
            });
        }

        match timeout(self.ack_timeout, issued.confirmation).await {
            Ok(Ok(())) => Ok(CommandOutcome::Acknowledged),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                debug!(
                    session_id = %self.session_id,
                    command = %command.action,
                    "Command not confirmed in time"
                );
                self.expire(issued.id).await;
                Ok(CommandOutcome::Unconfirmed)
            }
        }
    }

    pub async fn pause(&self) -> Result<CommandOutcome> {
        self.issue_command(Command::pause()).await
    }

    pub async fn resume(&self) -> Result<CommandOutcome> {
        self.issue_command(Command::resume()).await
    }

    pub async fn stop(&self) -> Result<CommandOutcome> {
        self.issue_command(Command::stop()).await
    }

    pub async fn approve(&self, response: Option<String>) -> Result<CommandOutcome> {
        self.issue_command(Command::approve(response)).await
    }

    pub async fn reject(&self, response: Option<String>) -> Result<CommandOutcome> {
        self.issue_command(Command::reject(response)).await
    }

    /// Drops expired intents so the authoritative state shows through.
    /// Returns how many were dropped.
    pub async fn rollback_unconfirmed(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorCommand::Rollback { respond_to: tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Stops the actor and the connection. Idempotent; nothing is published
    /// afterwards.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(session_id = %self.session_id, "Closing session");
            self.cancel.cancel();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn expire(&self, intent_id: u64) {
        // Ignore send errors - the actor may have shut down
        let _ = self.sender.send(ActorCommand::Expire { intent_id }).await;
    }
}

// ============================================================================
// Session Actor
// ============================================================================

enum StreamEnd {
    /// Dropped without a terminal event.
    Dropped { received: bool },
    /// Terminal event reached.
    Finished,
    Cancelled,
}

struct SessionActor {
    session_id: SessionId,
    config: Arc<ClientConfig>,
    transport: Arc<dyn SessionTransport>,
    receiver: mpsc::Receiver<ActorCommand>,
    publisher: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,

    /// Authoritative reduced state.
    session: Session,
    ledger: IntentLedger,
    /// Confirmation senders keyed by intent id.
    waiters: HashMap<u64, oneshot::Sender<()>>,
    connection: ConnectionState,
    revision: u64,
    last_event_id: Option<String>,
    /// Consecutive connection attempts that produced no frame.
    failures: u32,
    /// Backoff before the next attempt.
    delay: Duration,
}

impl SessionActor {
    async fn run(mut self) {
        info!(session_id = %self.session_id, "Session actor starting");

        let mut reconnecting = false;
        loop {
            let Some(stream) = self.connect_with_retry(reconnecting).await else {
                break;
            };
            match self.read_stream(stream).await {
                StreamEnd::Dropped { received } => {
                    if !received {
                        self.failures = self.failures.saturating_add(1);
                    }
                    reconnecting = true;
                }
                StreamEnd::Finished => {
                    self.serve_until_closed().await;
                    break;
                }
                StreamEnd::Cancelled => break,
            }
        }

        info!(session_id = %self.session_id, "Session actor stopped");
    }

    /// Opens the stream, retrying with exponential backoff.
    ///
    /// The failure count and backoff only reset once a frame arrives, so a
    /// server that accepts and hangs up at once still exhausts the attempts.
    /// Returns `None` when cancelled, or after giving up, in which case the
    /// session has been failed and the actor kept serving until closed.
    async fn connect_with_retry(&mut self, reconnecting: bool) -> Option<FrameStream> {
        if reconnecting {
            self.backoff().await?;
        }

        loop {
            let transport = Arc::clone(&self.transport);
            let session_id = self.session_id.clone();
            let last_event_id = self.last_event_id.clone();
            let open = async move { transport.open(&session_id, last_event_id.as_deref()).await };

            match self.serve_while(open).await? {
                Ok(stream) => {
                    info!(
                        session_id = %self.session_id,
                        attempt = self.failures.saturating_add(1),
                        "Stream connected"
                    );
                    self.set_connection(ConnectionState::Connected);
                    return Some(stream);
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    warn!(
                        session_id = %self.session_id,
                        attempt = self.failures,
                        error = %e,
                        "Failed to open stream"
                    );
                }
            }

            self.backoff().await?;
        }
    }

    /// Waits out the current backoff, or fails the session once the
    /// attempts are used up. `None` means stop connecting.
    async fn backoff(&mut self) -> Option<()> {
        if self.failures >= self.config.max_reconnect_attempts {
            self.fail(RECONNECT_EXHAUSTED);
            self.serve_until_closed().await;
            return None;
        }

        self.set_connection(ConnectionState::Reconnecting {
            attempt: self.failures.saturating_add(1),
        });
        let delay = self.delay;
        self.serve_while(sleep(delay)).await?;
        self.delay = self.config.next_delay(delay);
        Some(())
    }

    /// Reads frames until the stream ends, the session terminates or the
    /// actor is cancelled.
    async fn read_stream(&mut self, mut stream: FrameStream) -> StreamEnd {
        let idle_timeout = self.config.idle_timeout;
        let mut deadline = idle_timeout.map(|d| Instant::now() + d);
        let mut received = false;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,

                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!(session_id = %self.session_id, "All handles dropped");
                        return StreamEnd::Cancelled;
                    }
                },

                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        deadline = idle_timeout.map(|d| Instant::now() + d);
                        if !received {
                            received = true;
                            self.failures = 0;
                            self.delay = self.config.retry_initial_delay;
                        }
                        self.handle_frame(frame);
                        if self.session.is_terminal() {
                            info!(
                                session_id = %self.session_id,
                                status = %self.session.status,
                                "Session reached terminal status"
                            );
                            self.set_connection(ConnectionState::Finished);
                            return StreamEnd::Finished;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %self.session_id, error = %e, "Stream read failed");
                        return StreamEnd::Dropped { received };
                    }
                    None => {
                        info!(session_id = %self.session_id, "Stream closed by server");
                        return StreamEnd::Dropped { received };
                    }
                },

                _ = idle_elapsed(deadline) => {
                    warn!(
                        session_id = %self.session_id,
                        idle_secs = idle_timeout.map(|d| d.as_secs()).unwrap_or_default(),
                        "Stream idle, reconnecting"
                    );
                    return StreamEnd::Dropped { received };
                }
            }
        }
    }

    /// Drives `fut` while serving handle commands. `None` if cancelled.
    async fn serve_while<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return None,

                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => return None,
                },

                output = &mut fut => return Some(output),
            }
        }
    }

    async fn serve_until_closed(&mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return,

                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => return,
                },
            }
        }
    }

    fn handle_command(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Issue {
                command,
                respond_to,
            } => {
                let result = self.handle_issue(command);
                // Ignore send error - the caller may have given up
                let _ = respond_to.send(result);
            }
            ActorCommand::Expire { intent_id } => {
                self.waiters.remove(&intent_id);
                if self.ledger.expire(intent_id) {
                    self.publish();
                }
            }
            ActorCommand::Rollback { respond_to } => {
                let dropped = self.ledger.discard_expired();
                if dropped > 0 {
                    debug!(session_id = %self.session_id, dropped, "Rolled back expired intents");
                    self.publish();
                }
                let _ = respond_to.send(dropped);
            }
        }
    }

    fn handle_issue(&mut self, command: Command) -> Result<IssuedIntent> {
        if self.session.is_terminal() {
            return Err(ClientError::SessionEnded {
                status: self.session.status.to_string(),
            });
        }

        let id = self.ledger.issue(&command, Utc::now());
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        debug!(
            session_id = %self.session_id,
            intent_id = id,
            command = %command.action,
            "Intent issued"
        );
        self.publish();

        Ok(IssuedIntent {
            id,
            confirmation: rx,
        })
    }

    fn handle_frame(&mut self, frame: Frame) {
        if let Some(id) = &frame.id {
            self.last_event_id = Some(id.clone());
        }

        match parse_frame(&frame, Utc::now()) {
            Ok(event) => self.ingest(event),
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    frame = %truncate(&frame.data, 200),
                    "Dropping malformed frame"
                );
            }
        }
    }

    /// Reduces one event, settles intents it confirms and publishes.
    fn ingest(&mut self, event: SessionEvent) {
        let confirmed = self.ledger.reconcile(&event);
        let reduction = apply(&mut self.session, event);

        if reduction.changed || !confirmed.is_empty() {
            self.publish();
        }
        for id in confirmed {
            if let Some(waiter) = self.waiters.remove(&id) {
                let _ = waiter.send(());
            }
        }
    }

    fn fail(&mut self, reason: &str) {
        error!(session_id = %self.session_id, reason, "Session failed");
        self.connection = ConnectionState::Failed {
            reason: reason.to_string(),
        };
        self.ingest(SessionEvent::Failed {
            error: reason.to_string(),
            at: Utc::now(),
        });
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.connection != connection {
            self.connection = connection;
            self.publish();
        }
    }

    fn publish(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.revision = self.revision.saturating_add(1);
        let snapshot = SessionSnapshot {
            revision: self.revision,
            connection: self.connection.clone(),
            session: self.ledger.overlay(&self.session),
            intents: self.ledger.pending().to_vec(),
        };
        // send_replace never fails, even with no receivers.
        self.publisher.send_replace(snapshot);
    }
}

async fn idle_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s.get(..idx).unwrap_or(s),
        None => s,
    }
}
