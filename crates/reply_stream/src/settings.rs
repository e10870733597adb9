use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TRANSPORT_ERROR_MESSAGE: &str =
    "Sorry, something went wrong while generating a reply. Please try again.";
pub const DEFAULT_UPSTREAM_ERROR_FALLBACK: &str =
    "The assistant ran into a problem and could not finish this reply.";

/// Pacing and failure-text settings for reply streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Milliseconds between display ticks
    pub reveal_interval_ms: u64,
    /// Characters revealed per tick
    pub chars_per_tick: usize,
    /// Fixed pause between the placeholder and the first revealed text
    pub pacing_delay_ms: u64,
    /// Abort a read that stays silent this long. Unset means wait forever.
    pub stall_timeout_ms: Option<u64>,
    /// Shown instead of the reply when the connection fails
    pub transport_error_message: String,
    /// Shown when the service reports an error without a message
    pub upstream_error_fallback: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reveal_interval_ms: 8,
            chars_per_tick: 1,
            pacing_delay_ms: 300,
            stall_timeout_ms: None,
            transport_error_message: DEFAULT_TRANSPORT_ERROR_MESSAGE.to_string(),
            upstream_error_fallback: DEFAULT_UPSTREAM_ERROR_FALLBACK.to_string(),
        }
    }
}

impl StreamSettings {
    pub fn reveal_interval(&self) -> Duration {
        // A zero period would make the tick interval panic
        Duration::from_millis(self.reveal_interval_ms.max(1))
    }

    pub fn chars_per_tick(&self) -> usize {
        self.chars_per_tick.max(1)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    /// Text to show for an upstream error frame
    pub fn upstream_error_text(&self, message: &str) -> String {
        if message.trim().is_empty() {
            self.upstream_error_fallback.clone()
        } else {
            message.to_string()
        }
    }
}
