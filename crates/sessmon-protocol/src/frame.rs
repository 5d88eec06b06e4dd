//! Frame decoding for incrementally delivered streams.
//!
//! Chunks may arrive at any size and may split a line, or a UTF-8 character,
//! anywhere. [`LineBuffer`] carries the unfinished fragment between chunks so
//! the produced lines do not depend on how the stream was chunked.
//! [`FrameDecoder`] then applies one of two framings on top:
//!
//! - [`Framing::DataLines`]: every `data: ` line is one frame, everything else
//!   is ignored (comments, keep-alives, blank separators).
//! - [`Framing::EventStream`]: standard server-sent events. `data:` lines
//!   accumulate and a blank line dispatches them as one frame, carrying the
//!   `event:` name and the last seen `id:`.

use serde::{Deserialize, Serialize};

/// Line prefix marking a payload in `data:`-line framing.
pub const DATA_PREFIX: &str = "data: ";

// ============================================================================
// Frame
// ============================================================================

/// One decoded message from the transport, before JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub data: String,
    /// SSE `event:` name, if any.
    pub event: Option<String>,
    /// Last SSE `id:` seen on this connection.
    pub id: Option<String>,
}

impl Frame {
    /// Creates a frame with only a payload.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }
}

/// How payload frames are delimited in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One `data: <json>` line per frame.
    #[default]
    DataLines,
    /// Server-sent events with blank-line dispatch.
    EventStream,
}

// ============================================================================
// Line Buffer
// ============================================================================

/// Byte-level carry-over buffer that yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed.
    ///
    /// Lines are split on `\n` with a trailing `\r` removed. The final
    /// fragment stays buffered until a later chunk completes it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line));
        }
        lines
    }

    /// Flushes the remaining fragment at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = decode_line(&rest);
        (!line.is_empty()).then_some(line)
    }

    /// Number of buffered bytes not yet forming a complete line.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

// ============================================================================
// Frame Decoder
// ============================================================================

/// Restartable per connection: create a new decoder for every stream.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    lines: LineBuffer,
    data: Vec<String>,
    event: Option<String>,
    last_id: Option<String>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            lines: LineBuffer::new(),
            data: Vec::new(),
            event: None,
            last_id: None,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Feeds a chunk and returns the frames it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let lines = self.lines.push(chunk);
        lines
            .iter()
            .filter_map(|line| self.decode(line))
            .collect()
    }

    /// Flushes any buffered line and, for event streams, an undispatched message.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if let Some(line) = self.lines.finish() {
            frames.extend(self.decode(&line));
        }
        if self.framing == Framing::EventStream {
            frames.extend(self.dispatch());
        }
        frames
    }

    fn decode(&mut self, line: &str) -> Option<Frame> {
        match self.framing {
            Framing::DataLines => line.strip_prefix(DATA_PREFIX).map(Frame::data),
            Framing::EventStream => self.decode_event_line(line),
        }
    }

    fn decode_event_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(Frame {
            data,
            event: self.event.take(),
            id: self.last_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_in_chunks(framing: Framing, input: &[u8], size: usize) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new(framing);
        let mut frames = Vec::new();
        for chunk in input.chunks(size) {
            frames.extend(decoder.push(chunk));
        }
        frames.extend(decoder.finish());
        frames
    }

    fn sample_data_lines() -> Vec<u8> {
        let mut body = String::new();
        body.push_str(": keep-alive\n");
        body.push_str("data: {\"type\":\"mode\",\"totalSteps\":3,\"mode\":\"full\"}\n\n");
        for n in 1..=3 {
            body.push_str(&format!(
                "data: {{\"step\":{n},\"status\":\"running\",\"detail\":\"Vérification ✓ étape {n}\"}}\r\n"
            ));
            body.push_str(&format!("data: {{\"step\":{n},\"status\":\"complete\"}}\n"));
        }
        body.push_str("event: noise\n");
        body.push_str("data: {\"type\":\"result\",\"report\":{\"validationStatus\":\"ready\"}}");
        body.into_bytes()
    }

    #[test]
    fn test_line_buffer_keeps_partial_fragment() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"hel"), Vec::<String>::new());
        assert_eq!(buffer.push(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(buffer.buffered(), 3);
        assert_eq!(buffer.push(b"ld\r\n\n"), vec!["world".to_string(), String::new()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_flushes_tail_on_finish() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"a\ntail");
        assert_eq!(buffer.finish(), Some("tail".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_split_utf8_character_is_reassembled() {
        let text = "data: é✓\n".as_bytes();
        let mut decoder = FrameDecoder::new(Framing::DataLines);
        let mut frames = Vec::new();
        for byte in text {
            frames.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![Frame::data("é✓")]);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let input = sample_data_lines();
        let whole = decode_in_chunks(Framing::DataLines, &input, input.len());
        assert_eq!(whole.len(), 8);
        for size in [1, 2, 3, 7, 64, 500] {
            assert_eq!(decode_in_chunks(Framing::DataLines, &input, size), whole);
        }
    }

    #[test]
    fn test_data_lines_ignore_non_data_lines() {
        let frames = decode_in_chunks(
            Framing::DataLines,
            b": comment\nevent: x\ndata: {\"a\":1}\nretry: 10\n\ndata:{\"no\":\"space\"}\n",
            4,
        );
        assert_eq!(frames, vec![Frame::data("{\"a\":1}")]);
    }

    #[test]
    fn test_event_stream_dispatches_on_blank_line() {
        let input = b"id: 7\nevent: update\ndata: {\"type\":\"output\",\ndata: \"content\":\"hi\"}\n\n: ping\ndata: ping\n\n";
        let frames = decode_in_chunks(Framing::EventStream, input, 3);

        assert_eq!(frames.len(), 2);
        let first = frames.first().unwrap();
        assert_eq!(first.data, "{\"type\":\"output\",\n\"content\":\"hi\"}");
        assert_eq!(first.event.as_deref(), Some("update"));
        assert_eq!(first.id.as_deref(), Some("7"));

        let second = frames.get(1).unwrap();
        assert_eq!(second.data, "ping");
        assert_eq!(second.event, None);
        assert_eq!(second.id.as_deref(), Some("7"));
    }

    #[test]
    fn test_event_stream_chunking_does_not_change_output() {
        let input = b"data: {\"type\":\"step_start\",\"step\":{\"id\":\"a\"}}\n\nid: 2\ndata: {\"type\":\"step_complete\"}\n\ndata: {\"type\":\"complete\"}";
        let whole = decode_in_chunks(Framing::EventStream, input, input.len());
        assert_eq!(whole.len(), 3);
        for size in [1, 5, 11] {
            assert_eq!(decode_in_chunks(Framing::EventStream, input, size), whole);
        }
    }

    #[test]
    fn test_event_without_data_is_not_dispatched() {
        let frames = decode_in_chunks(Framing::EventStream, b"event: lonely\n\n", 1);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_framing_deserializes_snake_case() {
        let framing: Framing = serde_json::from_str("\"event_stream\"").unwrap();
        assert_eq!(framing, Framing::EventStream);
    }
}
