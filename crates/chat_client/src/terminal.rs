use reply_stream::{TurnEvent, TurnState};
use std::io::{self, Write};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PLACEHOLDER: &str = "…";

struct Colors {
    dim: &'static str,
    red: &'static str,
    reset: &'static str,
    /// Return to line start and blank it
    clear_line: &'static str,
}

impl Colors {
    fn new(enabled: bool) -> Self {
        if enabled {
            Self {
                dim: "\x1b[2m",
                red: "\x1b[31m",
                reset: "\x1b[0m",
                clear_line: "\r\x1b[2K",
            }
        } else {
            Self {
                dim: "",
                red: "",
                reset: "",
                clear_line: "",
            }
        }
    }
}

/// Writes turn events to a terminal as one growing line of reply text
pub struct TerminalRenderer<W: Write> {
    out: W,
    colors: Colors,
    interactive: bool,
    /// Reply text already written for the current turn
    printed: String,
    placeholder_visible: bool,
}

impl<W: Write> TerminalRenderer<W> {
    /// `interactive` output is a terminal that understands escape sequences
    pub fn new(out: W, interactive: bool) -> Self {
        Self {
            out,
            colors: Colors::new(interactive),
            interactive,
            printed: String::new(),
            placeholder_visible: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn handle(&mut self, event: &TurnEvent) -> io::Result<()> {
        match event {
            TurnEvent::StateChanged { state, .. } => match state {
                TurnState::Submitted => self.printed.clear(),
                // Only a terminal can take the indicator back again
                TurnState::Placeholder if self.interactive => {
                    write!(self.out, "{}{}{}", self.colors.dim, PLACEHOLDER, self.colors.reset)?;
                    self.placeholder_visible = true;
                }
                TurnState::Placeholder => {}
                TurnState::Streaming | TurnState::Failed | TurnState::Complete => {}
            },
            TurnEvent::MessageRenamed { from, to, .. } => {
                debug!("Reply {} continues as {}", from, to);
            }
            TurnEvent::Revealed { content, .. } => {
                self.clear_placeholder()?;
                if let Some(new_text) = content.strip_prefix(self.printed.as_str()) {
                    write!(self.out, "{new_text}")?;
                    self.printed = content.clone();
                }
            }
            TurnEvent::Finalized(turn) => {
                self.clear_placeholder()?;
                match turn.reply.strip_prefix(self.printed.as_str()) {
                    Some(rest) => write!(self.out, "{rest}")?,
                    None => {
                        // The shown text was replaced, e.g. by an apology
                        writeln!(self.out)?;
                        write!(self.out, "{}{}{}", self.colors.red, turn.reply, self.colors.reset)?;
                    }
                }
                writeln!(self.out)?;
                self.printed.clear();
            }
            TurnEvent::Discarded { .. } => {
                self.clear_placeholder()?;
                writeln!(self.out, "{}[cancelled]{}", self.colors.dim, self.colors.reset)?;
                self.printed.clear();
            }
            TurnEvent::Saved { turn_id } => debug!("Turn {} saved", turn_id),
            TurnEvent::SaveFailed { turn_id, error } => {
                warn!("Failed to save turn {}: {}", turn_id, error);
            }
        }
        self.out.flush()
    }

    fn clear_placeholder(&mut self) -> io::Result<()> {
        if self.placeholder_visible {
            write!(self.out, "{}", self.colors.clear_line)?;
            self.placeholder_visible = false;
        }
        Ok(())
    }
}

/// Render events until every sender is gone
pub async fn render_events(mut events: mpsc::UnboundedReceiver<TurnEvent>, interactive: bool) {
    let mut renderer = TerminalRenderer::new(io::stdout(), interactive);
    while let Some(event) = events.recv().await {
        if let Err(e) = renderer.handle(&event) {
            warn!("Failed to write to terminal: {}", e);
        }
    }
}
