//! Fragment sources for assistant replies
//!
//! This module provides the abstractions the engine reads replies from,
//! supporting both live HTTP bodies and recorded playback with identical
//! downstream processing.

use crate::error::StreamError;
use crate::recording::{PlaybackState, RecordedChunk, StreamRecorder};
use crate::utils;
use async_trait::async_trait;
use reqwest::Response;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An ordered stream of raw reply chunks
#[async_trait]
pub trait ChunkStream: Send {
    /// Next chunk, or `Ok(None)` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError>;
}

/// What the service needs to produce a reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRequest {
    pub conversation_id: String,
    pub message: String,
}

/// Opens a fragment source for one reply
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, request: &ReplyRequest) -> Result<Box<dyn ChunkStream>, StreamError>;
}

/// Real HTTP response chunk stream
pub struct HttpChunkStream {
    response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(StreamError::Network(format!("HTTP chunk error: {e}"))),
        }
    }
}

/// Recorded chunk stream for playback
pub struct PlaybackChunkStream {
    chunks: Vec<RecordedChunk>,
    current_index: usize,
    start_time: Instant,
    fast_mode: bool,
}

impl PlaybackChunkStream {
    pub fn new(chunks: Vec<RecordedChunk>, fast_mode: bool) -> Self {
        Self {
            chunks,
            current_index: 0,
            start_time: Instant::now(),
            fast_mode,
        }
    }
}

#[async_trait]
impl ChunkStream for PlaybackChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let Some(chunk) = self.chunks.get(self.current_index) else {
            return Ok(None);
        };

        if self.fast_mode {
            tokio::time::sleep(Duration::from_millis(17)).await;
        } else {
            let expected_time = Duration::from_millis(chunk.timestamp_ms);
            let elapsed = self.start_time.elapsed();
            if elapsed < expected_time {
                tokio::time::sleep(expected_time - elapsed).await;
            }
        }

        self.current_index += 1;
        Ok(Some(chunk.data.clone().into_bytes()))
    }
}

/// Requests replies from an HTTP endpoint that answers with an event stream
pub struct HttpConnector {
    client: reqwest::Client,
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl HttpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_bearer_token(self, token: &str) -> Self {
        self.with_header("authorization", format!("Bearer {token}"))
    }
}

#[async_trait]
impl StreamConnector for HttpConnector {
    async fn connect(&self, request: &ReplyRequest) -> Result<Box<dyn ChunkStream>, StreamError> {
        let mut request_builder = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream");

        for (key, value) in &self.headers {
            request_builder = request_builder.header(key, value);
        }

        let response = request_builder
            .json(request)
            .send()
            .await
            .map_err(|e| StreamError::Network(e.to_string()))?;

        debug!("Response headers: {:?}", response.headers());

        let response = utils::check_response_status(response).await?;
        Ok(Box::new(HttpChunkStream::new(response)))
    }
}

/// Serves recorded sessions, one per connect
pub struct PlaybackConnector {
    playback: PlaybackState,
}

impl PlaybackConnector {
    pub fn new(playback: PlaybackState) -> Self {
        Self { playback }
    }
}

#[async_trait]
impl StreamConnector for PlaybackConnector {
    async fn connect(&self, _request: &ReplyRequest) -> Result<Box<dyn ChunkStream>, StreamError> {
        let session = self.playback.next_session().ok_or_else(|| {
            StreamError::Network("No more recorded sessions available".to_string())
        })?;

        debug!("Playing back session with {} chunks", session.chunks.len());
        Ok(Box::new(PlaybackChunkStream::new(
            session.chunks,
            self.playback.fast,
        )))
    }
}

/// Wraps another connector and records every stream it opens
pub struct RecordingConnector<C> {
    inner: C,
    recorder: Arc<StreamRecorder>,
}

impl<C: StreamConnector> RecordingConnector<C> {
    pub fn new(inner: C, recorder: Arc<StreamRecorder>) -> Self {
        Self { inner, recorder }
    }
}

#[async_trait]
impl<C: StreamConnector> StreamConnector for RecordingConnector<C> {
    async fn connect(&self, request: &ReplyRequest) -> Result<Box<dyn ChunkStream>, StreamError> {
        // Start before connecting so recorded timestamps include the latency
        let request_json = serde_json::to_value(request).unwrap_or_default();
        if let Err(e) = self.recorder.start_recording(request_json) {
            warn!("Failed to start recording: {e}");
        }

        let inner = self.inner.connect(request).await?;
        Ok(Box::new(RecordingChunkStream {
            inner,
            recorder: self.recorder.clone(),
            partial: Vec::new(),
        }))
    }
}

struct RecordingChunkStream {
    inner: Box<dyn ChunkStream>,
    recorder: Arc<StreamRecorder>,
    /// Leading bytes of a character that continues in the next chunk
    partial: Vec<u8>,
}

#[async_trait]
impl ChunkStream for RecordingChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let chunk = self.inner.next_chunk().await?;
        match &chunk {
            Some(bytes) => {
                self.partial.extend_from_slice(bytes);
                let text = take_complete_utf8(&mut self.partial);
                if !text.is_empty() {
                    self.record(&text);
                }
            }
            None => self.end(),
        }
        Ok(chunk)
    }
}

impl RecordingChunkStream {
    fn record(&self, text: &str) {
        if let Err(e) = self.recorder.record_chunk(text) {
            warn!("Failed to record chunk: {e}");
        }
    }

    fn end(&mut self) {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.record(&String::from_utf8_lossy(&rest));
        }
        if let Err(e) = self.recorder.end_recording() {
            warn!("Failed to end recording: {e}");
        }
    }
}

/// Drain the longest prefix of `bytes` that is complete UTF-8, leaving a
/// trailing incomplete character in place. Invalid sequences are replaced.
fn take_complete_utf8(bytes: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    };
    let head: Vec<u8> = bytes.drain(..complete).collect();
    String::from_utf8_lossy(&head).into_owned()
}

// Readers may stop at a terminal frame without draining to EOF
impl Drop for RecordingChunkStream {
    fn drop(&mut self) {
        self.end();
    }
}
