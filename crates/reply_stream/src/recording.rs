use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// One recorded reply stream: the request that opened it and every raw chunk
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordingSession {
    /// The request that was sent
    pub request: serde_json::Value,
    /// Timestamp of when the recording was started
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Raw chunks as received from the network
    pub chunks: Vec<RecordedChunk>,
}

/// Single recorded chunk with timing info
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedChunk {
    /// Raw chunk text, frame boundaries included
    pub data: String,
    /// Milliseconds since recording start
    pub timestamp_ms: u64,
}

#[derive(Default)]
struct RecorderState {
    session: Option<RecordingSession>,
    start_time: Option<Instant>,
}

/// Records reply streams into a JSON array file
pub struct StreamRecorder {
    file_path: PathBuf,
    state: Mutex<RecorderState>,
}

impl StreamRecorder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
            state: Mutex::new(RecorderState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecorderState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Recorder state lock poisoned"))
    }

    /// Start a new recording session
    pub fn start_recording(&self, request: serde_json::Value) -> Result<()> {
        let mut state = self.lock()?;
        state.session = Some(RecordingSession {
            request,
            timestamp: chrono::Utc::now(),
            chunks: Vec::new(),
        });
        state.start_time = Some(Instant::now());
        Ok(())
    }

    /// Record an incoming chunk
    pub fn record_chunk(&self, data: &str) -> Result<()> {
        let mut state = self.lock()?;
        let Some(start_time) = state.start_time else {
            return Ok(());
        };
        if let Some(session) = state.session.as_mut() {
            session.chunks.push(RecordedChunk {
                data: data.to_string(),
                timestamp_ms: start_time.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }

    /// End the current recording session and append it to the file
    pub fn end_recording(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.start_time = None;
        let Some(session) = state.session.take() else {
            return Ok(());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.file_path)
            .context("Failed to open recording file")?;

        let json = serde_json::to_string_pretty(&session)?;
        let file_size = file.metadata()?.len();
        if file_size == 0 {
            writeln!(file, "[")?;
        } else {
            // Drop the closing "\n]\n" and continue the array
            file.set_len(file_size.saturating_sub(3))?;
            file.seek(std::io::SeekFrom::End(0))?;
            writeln!(file, ",")?;
        }
        writeln!(file, "{json}")?;
        writeln!(file, "]")?;
        Ok(())
    }
}

/// Recorded sessions handed out in order, shared between connectors
#[derive(Clone)]
pub struct PlaybackState {
    sessions: Arc<Vec<RecordingSession>>,
    index: Arc<Mutex<usize>>,
    pub fast: bool,
}

impl PlaybackState {
    pub fn from_file<P: AsRef<Path>>(path: P, fast: bool) -> Result<Self> {
        let mut file = File::open(path).context("Failed to open recording file")?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read recording file")?;
        let sessions: Vec<RecordingSession> =
            serde_json::from_str(&contents).context("Failed to parse recording file")?;
        Ok(Self::from_sessions(sessions, fast))
    }

    pub fn from_sessions(sessions: Vec<RecordingSession>, fast: bool) -> Self {
        Self {
            sessions: Arc::new(sessions),
            index: Arc::new(Mutex::new(0)),
            fast,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Take the next session, or None if exhausted
    pub fn next_session(&self) -> Option<RecordingSession> {
        let mut idx = self.index.lock().ok()?;
        let session = self.sessions.get(*idx)?.clone();
        *idx += 1;
        Some(session)
    }
}
