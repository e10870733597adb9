mod cache;
mod cli;
mod config;
mod logging;
mod persistence;
mod terminal;

use crate::cli::Args;
use crate::config::ClientSettings;
use crate::persistence::FileMessageStore;
use anyhow::{Context, Result};
use reply_stream::{
    ConversationController, HttpConnector, PlaybackConnector, PlaybackState, RecordingConnector,
    StreamConnector, StreamRecorder,
};
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn build_connector(args: &Args, settings: &ClientSettings) -> Result<Arc<dyn StreamConnector>> {
    if let Some(path) = &args.playback {
        let playback = PlaybackState::from_file(path, args.fast)?;
        info!(
            "Playing back {} recorded sessions from {}",
            playback.session_count(),
            path.display()
        );
        return Ok(Arc::new(PlaybackConnector::new(playback)));
    }

    let endpoint = args
        .endpoint
        .clone()
        .or_else(|| settings.endpoint.clone())
        .context("No endpoint configured, pass --endpoint or set \"endpoint\" in settings.json")?;

    let mut connector = HttpConnector::new(endpoint);
    if let Some(token) = &settings.auth_token {
        connector = connector.with_bearer_token(token);
    }

    if let Some(path) = &args.record {
        info!("Recording reply streams to {}", path.display());
        let recorder = Arc::new(StreamRecorder::new(path));
        return Ok(Arc::new(RecordingConnector::new(connector, recorder)));
    }

    Ok(Arc::new(connector))
}

/// Wait for the turn to finish, cancelling it on Ctrl-C
async fn drive_turn(controller: &mut ConversationController) {
    tokio::select! {
        _ = controller.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Cancelling reply");
            controller.cancel().await;
        }
    }
}

async fn run_interactive(controller: &mut ConversationController) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match controller.submit(line) {
            Ok(_) => drive_turn(controller).await,
            Err(e) => warn!("Message not sent: {}", e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logging(args.verbose);

    let settings = config::load_settings(args.settings.as_deref())?;
    let connector = build_connector(&args, &settings)?;

    let store = Arc::new(FileMessageStore::new(
        persistence::default_root_dir(),
        Duration::from_secs(args.history_ttl_secs),
    ));
    let history = store.load_history(&args.conversation)?;
    info!(
        "Conversation {} has {} earlier turns",
        args.conversation,
        history.len()
    );

    let (controller, events) = ConversationController::new(
        args.conversation.clone(),
        connector,
        store,
        settings.stream.clone(),
    );
    let mut controller = controller.with_history(history);
    let renderer = tokio::spawn(terminal::render_events(
        events,
        std::io::stdout().is_terminal(),
    ));

    let result = match &args.message {
        Some(message) => match controller.submit(message.as_str()) {
            Ok(_) => {
                drive_turn(&mut controller).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        None => run_interactive(&mut controller).await,
    };

    controller.shutdown().await;
    drop(controller);
    if let Err(e) = renderer.await {
        warn!("Renderer stopped abnormally: {}", e);
    }

    result
}
