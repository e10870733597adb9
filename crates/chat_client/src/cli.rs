use clap::Parser;
use std::path::PathBuf;

/// Define the application arguments
#[derive(Parser, Debug)]
#[command(version, about = "Chat with a streaming reply service from the terminal", long_about = None)]
pub struct Args {
    /// Reply endpoint, overrides the one in settings.json
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Conversation to continue
    #[arg(short, long, default_value = "default")]
    pub conversation: String,

    /// Send a single message and exit instead of reading from stdin
    #[arg(short, long)]
    pub message: Option<String>,

    /// Record raw reply streams to a file
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Play back recorded reply streams from a file
    #[arg(long, conflicts_with = "record")]
    pub playback: Option<PathBuf>,

    /// Fast playback mode - ignore chunk timing when playing recordings
    #[arg(long)]
    pub fast: bool,

    /// Path to settings.json (defaults to the config directory)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// How long loaded conversation history stays cached
    #[arg(long, default_value_t = 300)]
    pub history_ttl_secs: u64,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn parse() -> Self {
        <Args as Parser>::parse()
    }
}
