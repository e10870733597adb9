//! Example script to create a sample recording file
//!
//! Writes two recorded reply streams that `chat-client --playback` can replay:
//! a normal reply split awkwardly across chunks, and a reply where the service
//! reports an error before sending any content.

use anyhow::Result;
use reply_stream::recording::{RecordedChunk, RecordingSession};
use serde_json::json;

fn frame(payload: serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}

fn delta(text: &str) -> String {
    frame(json!({"type": "delta", "content": text}))
}

/// Spread `wire` over chunks of about `size` bytes, `step_ms` apart. Chunks
/// end on character boundaries since recordings store text.
fn chunked(wire: &str, size: usize, start_ms: u64, step_ms: u64) -> Vec<RecordedChunk> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < wire.len() {
        let mut end = (start + size).min(wire.len());
        while !wire.is_char_boundary(end) {
            end += 1;
        }
        chunks.push(RecordedChunk {
            data: wire[start..end].to_string(),
            timestamp_ms: start_ms + chunks.len() as u64 * step_ms,
        });
        start = end;
    }
    chunks
}

fn main() -> Result<()> {
    let reply = [
        "Rust",
        " is",
        " a",
        " systems",
        " programming",
        " language",
        " focused on memory safety",
        " without sacrificing performance \u{1f980}.",
    ];
    let mut wire = String::from(": connected\n\n");
    for fragment in reply {
        wire.push_str(&delta(fragment));
    }
    wire.push_str(&frame(json!({"type": "typing", "active": false})));
    wire.push_str(&frame(json!({"type": "complete"})));

    let answered = RecordingSession {
        request: json!({
            "conversation_id": "demo",
            "message": "What is Rust?"
        }),
        timestamp: chrono::Utc::now(),
        chunks: chunked(&wire, 48, 120, 60),
    };

    let failed = RecordingSession {
        request: json!({
            "conversation_id": "demo",
            "message": "And what about Go?"
        }),
        timestamp: chrono::Utc::now(),
        chunks: vec![RecordedChunk {
            data: frame(json!({"type": "error", "error": {"message": "The model is overloaded, try again later."}})),
            timestamp_ms: 400,
        }],
    };

    let recordings = vec![answered, failed];

    let file_path = "sample_recording.json";
    std::fs::write(file_path, serde_json::to_string_pretty(&recordings)?)?;

    println!("Sample recording file created: {}", file_path);
    Ok(())
}
