//! Assistant chat over server-sent events.
//!
//! Each session has at most one turn in flight. A turn opens the stream,
//! feeds every chunk through the SSE parser and hands decoded events to the
//! caller's callback. Transient failures are retried with exponential
//! backoff; authorization and not-found failures end the turn at once.

pub mod api;
pub mod backoff;
pub mod sse;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

pub use api::{ChatApi, ChatMessageRecord, ChatSessionRecord};
pub use backoff::BackoffPolicy;
pub use sse::{SseEvent, SseParser};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Opens the response body of one chat request.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, session_id: &str, message: &str) -> Result<ByteStream>;
}

/// Human-in-the-loop confirmation requested by the assistant before it runs
/// a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRequest {
    pub tool_name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub params_display: Option<serde_json::Value>,
    pub message: String,
    #[serde(default)]
    pub required_fields: Option<Vec<String>>,
    #[serde(default)]
    pub display_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(String),
    Status(String),
    HitlRequest(HitlRequest),
    /// A transient failure; the same request is sent again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    Done,
    /// Ends the turn. Emitted at most once.
    Error(String),
}

enum Decoded {
    Emit(ChatEvent),
    Finish(ChatEvent),
}

fn decode(event: SseEvent) -> Option<Decoded> {
    if event.data == "[DONE]" {
        return Some(Decoded::Finish(ChatEvent::Done));
    }
    if let Some(rest) = event.data.strip_prefix("[ERROR]") {
        return Some(Decoded::Finish(ChatEvent::Error(rest.trim().to_string())));
    }
    match event.event.as_str() {
        "done" => Some(Decoded::Finish(ChatEvent::Done)),
        "error" => Some(Decoded::Finish(ChatEvent::Error(event.data))),
        "status" => Some(Decoded::Emit(ChatEvent::Status(event.data))),
        "hitl_request" => match serde_json::from_str::<HitlRequest>(&event.data) {
            Ok(request) => Some(Decoded::Emit(ChatEvent::HitlRequest(request))),
            Err(e) => {
                warn!("Dropping malformed hitl_request: {}", e);
                None
            }
        },
        "message" => Some(Decoded::Emit(ChatEvent::Message(event.data))),
        other => {
            debug!("Ignoring SSE event {:?}", other);
            None
        }
    }
}

pub type ChatCallback = Arc<dyn Fn(ChatEvent) + Send + Sync>;

struct PendingTurn {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ChatSession {
    session_id: String,
    pending: Option<PendingTurn>,
    retry_count: Arc<AtomicU32>,
}

impl ChatSession {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            pending: None,
            retry_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Retries made by the current (or last) turn.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.pending
            .as_ref()
            .map(|p| !p.task.is_finished())
            .unwrap_or(false)
    }
}

pub struct StreamingChatClient {
    transport: Arc<dyn ChatTransport>,
    backoff: BackoffPolicy,
    sessions: HashMap<String, ChatSession>,
}

impl StreamingChatClient {
    pub fn new(transport: Arc<dyn ChatTransport>, backoff: BackoffPolicy) -> Self {
        Self {
            transport,
            backoff,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&self, session_id: &str) -> Option<&ChatSession> {
        self.sessions.get(session_id)
    }

    /// Starts a turn, cancelling any turn already running for the session.
    pub async fn start_turn<F>(&mut self, session_id: &str, message: &str, callback: F)
    where
        F: Fn(ChatEvent) + Send + Sync + 'static,
    {
        self.cancel(session_id).await;

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ChatSession::new(session_id));
        session.retry_count.store(0, Ordering::SeqCst);

        let token = CancellationToken::new();
        let turn = Turn {
            transport: self.transport.clone(),
            backoff: self.backoff.clone(),
            session_id: session_id.to_string(),
            message: message.to_string(),
            token: token.clone(),
            retry_count: session.retry_count.clone(),
            callback: Arc::new(callback),
        };
        let task = tokio::spawn(turn.run());
        session.pending = Some(PendingTurn { token, task });
    }

    /// Stops the session's turn. Once this returns no further callback for
    /// that turn will run.
    pub async fn cancel(&mut self, session_id: &str) -> bool {
        let Some(pending) = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.pending.take())
        else {
            return false;
        };
        let was_running = !pending.task.is_finished();
        pending.token.cancel();
        pending.task.abort();
        let _ = pending.task.await;
        if was_running {
            info!("Cancelled chat turn for session {}", session_id);
        }
        was_running
    }

    /// Waits for the session's current turn to end on its own.
    pub async fn wait(&mut self, session_id: &str) {
        let pending = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.pending.take());
        if let Some(pending) = pending {
            let _ = pending.task.await;
        }
    }

    pub async fn cancel_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.cancel(&id).await;
        }
    }
}

struct Turn {
    transport: Arc<dyn ChatTransport>,
    backoff: BackoffPolicy,
    session_id: String,
    message: String,
    token: CancellationToken,
    retry_count: Arc<AtomicU32>,
    callback: ChatCallback,
}

impl Turn {
    fn emit(&self, event: ChatEvent) {
        if !self.token.is_cancelled() {
            (self.callback)(event);
        }
    }

    async fn run(self) {
        let mut attempt = 0u32;
        loop {
            let error = match self.stream_once().await {
                Ok(()) => return,
                Err(e) => e,
            };
            if self.token.is_cancelled() {
                return;
            }
            if error.is_terminal() {
                warn!("Chat session {}: {}", self.session_id, error);
                self.emit(ChatEvent::Error(error.to_string()));
                return;
            }

            let Some(delay) = self.backoff.delay_for(attempt) else {
                warn!(
                    "Chat session {}: giving up after {} retries: {}",
                    self.session_id, attempt, error
                );
                self.emit(ChatEvent::Error(format!(
                    "Connection failed after {} retries: {}",
                    attempt, error
                )));
                return;
            };

            attempt += 1;
            self.retry_count.store(attempt, Ordering::SeqCst);
            info!(
                "Chat session {}: {} (retry {} in {:?})",
                self.session_id, error, attempt, delay
            );
            self.emit(ChatEvent::Retrying { attempt, delay });

            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One request. `Ok` means the turn ended (successfully, with a server
    /// error event, or by cancellation); `Err` is a transport failure.
    async fn stream_once(&self) -> Result<()> {
        let mut stream = tokio::select! {
            _ = self.token.cancelled() => return Ok(()),
            opened = self.transport.open(&self.session_id, &self.message) => opened?,
        };

        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                Some(bytes) => bytes?,
                None => {
                    if parser.has_partial() {
                        debug!("Chat stream ended inside an event; discarding it");
                    }
                    self.emit(ChatEvent::Done);
                    return Ok(());
                }
            };
            for event in parser.feed(&bytes) {
                match decode(event) {
                    Some(Decoded::Emit(event)) => self.emit(event),
                    Some(Decoded::Finish(event)) => {
                        self.emit(event);
                        return Ok(());
                    }
                    None => {}
                }
            }
        }
    }
}
