//! Shared helpers for controller integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use sessmon_client::{
    ClientConfig, FrameStream, SessionHandle, SessionSnapshot, SessionTransport, TransportError,
};
use sessmon_core::SessionId;
use sessmon_protocol::{Frame, OutboundCommand};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Fast retries, no idle check.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        retry_initial_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(40),
        max_reconnect_attempts: 3,
        command_ack_timeout: Duration::from_secs(2),
        idle_timeout: None,
        ..ClientConfig::default()
    }
}

// ============================================================================
// Scripted Transport
// ============================================================================

enum Connection {
    Refuse,
    Stream(mpsc::UnboundedReceiver<Result<Frame, TransportError>>),
}

/// Test side of one scripted connection. Dropping it ends the stream.
pub struct Feed {
    tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl Feed {
    /// Sends one payload frame.
    pub fn data(&self, payload: &str) {
        let _ = self.tx.send(Ok(Frame::data(payload)));
    }

    /// Sends a frame carrying an SSE id.
    pub fn data_with_id(&self, payload: &str, id: &str) {
        let _ = self.tx.send(Ok(Frame {
            data: payload.to_string(),
            event: None,
            id: Some(id.to_string()),
        }));
    }

    /// Breaks the stream with a read error.
    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Err(TransportError::Read(reason.to_string())));
    }
}

/// Transport whose connections and command results are scripted by the test.
///
/// Opens consume queued connections in order; with none left, opens fail.
#[derive(Default)]
pub struct ScriptedTransport {
    connections: Mutex<VecDeque<Connection>>,
    opens: Mutex<Vec<Option<String>>>,
    sent: Mutex<Vec<OutboundCommand>>,
    fail_sends: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a connection that accepts and returns its feed.
    pub fn accept(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .unwrap()
            .push_back(Connection::Stream(rx));
        Feed { tx }
    }

    /// Queues a refused connection.
    pub fn refuse(&self) {
        self.connections.lock().unwrap().push_back(Connection::Refuse);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// `Last-Event-ID` value of every open so far.
    pub fn opens(&self) -> Vec<Option<String>> {
        self.opens.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<OutboundCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    async fn open(
        &self,
        _session_id: &SessionId,
        last_event_id: Option<&str>,
    ) -> Result<FrameStream, TransportError> {
        self.opens
            .lock()
            .unwrap()
            .push(last_event_id.map(str::to_string));

        let next = self.connections.lock().unwrap().pop_front();
        match next {
            Some(Connection::Stream(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(Connection::Refuse) => Err(TransportError::HttpStatus { status: 503 }),
            None => Err(TransportError::Request("connection refused".to_string())),
        }
    }

    async fn send(
        &self,
        _session_id: &SessionId,
        command: &OutboundCommand,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::HttpStatus { status: 500 });
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }
}

// ============================================================================
// Waiting
// ============================================================================

/// Waits for a snapshot matching `predicate`, failing the test after [`WAIT`].
pub async fn wait_until<F>(handle: &SessionHandle, predicate: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .expect("session closed while waiting")
}
