//! Frame decoder for the line-oriented reply protocol
//!
//! Each line of the stream is either empty or a `data:` line carrying a JSON
//! payload with a `type` field. Chunks from the network may end anywhere,
//! including in the middle of a line or a multi-byte character, so the decoder
//! keeps the unterminated tail as raw bytes and re-parses once the next chunk
//! completes it.

use serde_json::Value;
use tracing::{debug, trace};

/// A decoded protocol event
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// Text to append to the reply
    Content(String),
    /// No more content will arrive
    Complete,
    /// The service gave up on this reply
    Error(String),
    /// Well-formed frame of a type this engine does not act on
    Signal { kind: String, payload: Value },
}

impl FrameEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameEvent::Complete | FrameEvent::Error(_))
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has already been emitted
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one raw chunk and return every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.decode_raw_line(&line[..line.len() - 1], true, &mut events);
        }
        events
    }

    /// Flush an unterminated final line once the source is exhausted
    pub fn finish(&mut self) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.decode_raw_line(&line, false, &mut events);
        }
        events
    }

    fn decode_raw_line(&mut self, raw: &[u8], terminated: bool, events: &mut Vec<FrameEvent>) {
        let text = String::from_utf8_lossy(raw);
        let line = text.strip_suffix('\r').unwrap_or(&*text);

        let Some(event) = decode_text_line(line, terminated) else {
            return;
        };

        if self.finished {
            debug!("Ignoring frame after terminal event: {:?}", event);
            return;
        }
        if event.is_terminal() {
            self.finished = true;
        }
        events.push(event);
    }
}

/// Decode one complete line, without its line terminator
pub fn decode_line(line: &str) -> Option<FrameEvent> {
    decode_text_line(line, true)
}

fn decode_text_line(line: &str, terminated: bool) -> Option<FrameEvent> {
    if line.is_empty() {
        return None;
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.strip_prefix(' ').unwrap_or(data);
        return Some(decode_payload(data));
    }

    if line.starts_with(':') || is_sse_field(line) {
        trace!("Skipping SSE line: {line}");
        return None;
    }

    // Not part of the protocol, but still bytes the user should see
    let mut text = line.to_string();
    if terminated {
        text.push('\n');
    }
    Some(FrameEvent::Content(text))
}

fn is_sse_field(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
}

/// Decode the payload of a `data:` line
pub fn decode_payload(data: &str) -> FrameEvent {
    if data.trim() == "[DONE]" {
        return FrameEvent::Complete;
    }

    let value = match serde_json::from_str::<Value>(data) {
        Ok(value @ Value::Object(_)) => value,
        _ => {
            debug!("Payload is not a structured frame, keeping it as text");
            return FrameEvent::Content(data.to_string());
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        debug!("Frame without a type, keeping it as text");
        return FrameEvent::Content(data.to_string());
    };

    match kind.as_str() {
        "delta" | "content" => match frame_text(&value) {
            Some(text) => FrameEvent::Content(text),
            None => {
                debug!("Content frame without text: {data}");
                FrameEvent::Content(String::new())
            }
        },
        "complete" | "done" => FrameEvent::Complete,
        "error" => FrameEvent::Error(error_message(&value)),
        _ => FrameEvent::Signal {
            kind,
            payload: value,
        },
    }
}

fn frame_text(value: &Value) -> Option<String> {
    for key in ["content", "delta", "text"] {
        match value.get(key) {
            Some(Value::String(text)) => return Some(text.clone()),
            Some(nested @ Value::Object(_)) => {
                if let Some(text) = frame_text(nested) {
                    return Some(text);
                }
            }
            _ => {}
        }
    }
    None
}

fn error_message(value: &Value) -> String {
    match value.get("error") {
        Some(Value::String(message)) => return message.clone(),
        Some(Value::Object(error)) => {
            if let Some(Value::String(message)) = error.get("message") {
                return message.clone();
            }
        }
        _ => {}
    }
    value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
