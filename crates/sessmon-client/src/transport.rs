//! Transport seam between the controller and the backend.
//!
//! The controller only needs two things from the outside world: a stream of
//! decoded frames for a session, and a way to post a command. Everything
//! HTTP-specific lives in [`HttpTransport`]; tests substitute a scripted
//! implementation.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Url;
use tracing::debug;

use sessmon_core::SessionId;
use sessmon_protocol::{Frame, FrameDecoder, Framing, OutboundCommand};

use crate::config::{ClientConfig, StreamEndpoint, StreamMethod, SESSION_ID_PLACEHOLDER};
use crate::error::TransportError;

/// Decoded frames of one connection. The stream ending, or yielding an
/// error, means the connection dropped.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Header carrying the last SSE id on reconnect.
pub const LAST_EVENT_ID: &str = "Last-Event-ID";

// ============================================================================
// Transport Trait
// ============================================================================

#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    /// Opens the event stream for a session.
    ///
    /// `last_event_id` is the last SSE id seen on a previous connection.
    async fn open(
        &self,
        session_id: &SessionId,
        last_event_id: Option<&str>,
    ) -> Result<FrameStream, TransportError>;

    /// Posts a control or approval command. Response bodies are ignored.
    async fn send(
        &self,
        session_id: &SessionId,
        command: &OutboundCommand,
    ) -> Result<(), TransportError>;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// reqwest-backed transport for the streaming and command endpoints.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    stream: StreamEndpoint,
    framing: Framing,
    command_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            stream: config.stream.clone(),
            framing: config.framing,
            command_timeout: config.request_timeout,
        })
    }

    /// Resolves a path template against the base URL. The session id is
    /// percent-encoded as a single path segment.
    pub fn endpoint_url(
        &self,
        template: &str,
        session_id: &SessionId,
    ) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| TransportError::InvalidUrl(self.base_url.clone()))?;
            segments.pop_if_empty();
            for part in template.split('/').filter(|p| !p.is_empty()) {
                segments.push(&part.replace(SESSION_ID_PLACEHOLDER, session_id.as_str()));
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl SessionTransport for HttpTransport {
    async fn open(
        &self,
        session_id: &SessionId,
        last_event_id: Option<&str>,
    ) -> Result<FrameStream, TransportError> {
        let url = self.endpoint_url(&self.stream.path, session_id)?;
        debug!(session_id = %session_id, url = %url, "Opening event stream");

        let mut request = match self.stream.method {
            StreamMethod::Get => self.client.get(url),
            StreamMethod::Post => {
                let request = self.client.post(url);
                match &self.stream.body {
                    Some(body) => request.json(body),
                    None => request,
                }
            }
        };
        request = request
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header(LAST_EVENT_ID, id);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(decode_stream(response.bytes_stream(), self.framing))
    }

    async fn send(
        &self,
        session_id: &SessionId,
        command: &OutboundCommand,
    ) -> Result<(), TransportError> {
        let template = format!("{}/{SESSION_ID_PLACEHOLDER}", command.endpoint());
        let url = self.endpoint_url(&template, session_id)?;
        debug!(session_id = %session_id, command = command.label(), "Posting command");

        self.client
            .post(url)
            .timeout(self.command_timeout)
            .json(&command.body())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ============================================================================
// Byte Stream Decoding
// ============================================================================

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
    finished: bool,
}

/// Turns a chunked byte stream into frames with a fresh decoder.
///
/// A read error is yielded once and ends the stream; a clean end flushes
/// whatever the decoder still buffers.
pub fn decode_stream<S, B, E>(bytes: S, framing: Framing) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: FrameDecoder::new(framing),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.ready.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(TransportError::Read(e.to_string())), state));
                }
                None => {
                    state.finished = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
