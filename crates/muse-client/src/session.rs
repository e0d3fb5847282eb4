//! The client-side chat session state machine.
//!
//! A session moves `Idle -> Sending -> Streaming -> (Idle | Errored)`. At
//! most one turn is ever in flight: a `send` while busy is rejected, not
//! queued. The user's message is appended synchronously before any network
//! activity, and the assistant's reply grows in place on the trailing
//! message as tokens arrive.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use muse_protocol::{AgentMemory, AttachmentKind, ChatRequest, Role, StreamEvent};

use crate::conversation::{Attachment, Conversation};
use crate::error::ChatError;
use crate::store::{LocalStore, RemoteSync};
use crate::transport::{ChatTransport, TurnStream};
use crate::uploader::{AttachmentUploader, upload_batch};

/// Where the session is in its turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// Uploading attachments and dispatching the request.
    Sending,
    /// Consuming the response stream.
    Streaming,
    /// The last turn failed after exhausting retries. Cleared by the next
    /// user action.
    Errored,
}

/// How a `send` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The turn ran to completion.
    Completed,
    /// Nothing happened: empty input, or the session was busy.
    Ignored,
    /// The user cancelled mid-turn. Distinct from failure; never retried.
    Cancelled,
}

/// Events the rendering layer can observe. A single consumer should apply
/// them in order; tokens reference the message they grow.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    UserMessage { message_id: String },
    AssistantStarted { message_id: String },
    Token { message_id: String, delta: String },
    TurnCompleted { message_id: String },
    TurnFailed { message: String },
    TurnCancelled,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initially selected tool.
    pub tool: String,
    /// Total attempts per logical send, including the first.
    pub max_attempts: u32,
    /// Backoff unit; attempt N waits N times this before retrying.
    pub base_delay: Duration,
    /// Case-insensitive substrings that block a message before sending.
    pub denylist: Vec<String>,
    /// Request a streamed response (the default). Off, the proxy answers
    /// with a single JSON reply instead.
    pub streaming: bool,
    /// Ask the proxy to best-effort persist tokens server-side.
    pub request_persistence: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tool: "chat".to_string(),
            max_attempts: 3,
            base_delay: Duration::from_millis(600),
            denylist: Vec::new(),
            streaming: true,
            request_persistence: false,
        }
    }
}

#[derive(Debug, Clone)]
struct LastSend {
    text: String,
    tool: String,
}

/// One conversation's worth of client chat state.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    uploader: Arc<dyn AttachmentUploader>,
    local: Option<LocalStore>,
    remote: Option<Arc<dyn RemoteSync>>,
    config: SessionConfig,

    phase: Mutex<SessionPhase>,
    conversation: Mutex<Conversation>,
    pending: Mutex<Vec<Attachment>>,
    memory: Mutex<AgentMemory>,
    tool: Mutex<String>,
    last_failed: Mutex<Option<LastSend>>,
    cancel: Mutex<CancellationToken>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        uploader: Arc<dyn AttachmentUploader>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let tool = config.tool.clone();
        Self {
            transport,
            uploader,
            local: None,
            remote: None,
            config,
            phase: Mutex::new(SessionPhase::Idle),
            conversation: Mutex::new(Conversation::new()),
            pending: Mutex::new(Vec::new()),
            memory: Mutex::new(AgentMemory::default()),
            tool: Mutex::new(tool),
            last_failed: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            events,
        }
    }

    /// Persist snapshots on this device after every completed turn.
    pub fn with_local_store(mut self, store: LocalStore) -> Self {
        self.local = Some(store);
        self
    }

    /// Sync the conversation to the backend after every completed turn.
    pub fn with_remote_sync(mut self, remote: Arc<dyn RemoteSync>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Resume an existing conversation instead of starting fresh.
    pub fn with_conversation(self, conversation: Conversation) -> Self {
        *self.conversation.lock().unwrap() = conversation;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap()
    }

    pub fn conversation(&self) -> Conversation {
        self.conversation.lock().unwrap().clone()
    }

    pub fn set_tool(&self, tool: impl Into<String>) {
        *self.tool.lock().unwrap() = tool.into();
    }

    pub fn tool(&self) -> String {
        self.tool.lock().unwrap().clone()
    }

    pub fn set_memory(&self, memory: AgentMemory) {
        *self.memory.lock().unwrap() = memory;
    }

    pub fn add_attachment(&self, attachment: Attachment) {
        self.pending.lock().unwrap().push(attachment);
    }

    pub fn pending_attachments(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Send one user message and drive the turn to its end.
    ///
    /// Empty input and busy sessions are silent no-ops. Moderation and
    /// missing-attachment problems fail before any network activity. On
    /// acceptance the user message is appended synchronously, then the
    /// attempt loop runs with linear backoff until success, cancellation,
    /// or the attempt budget is spent.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, ChatError> {
        if text.trim().is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        if let Some(term) = self.moderation_hit(text) {
            return Err(ChatError::Moderation(term));
        }

        let tool = self.tool();
        if let Some(required) = required_attachment(&tool) {
            let pending = self.pending.lock().unwrap();
            if !pending.iter().any(|a| a.kind == required) {
                return Err(ChatError::Validation(format!(
                    "the {tool} tool needs a {} attachment",
                    required.as_str()
                )));
            }
        }

        // Claim the session. Concurrent sends are rejected, not queued.
        {
            let mut phase = self.phase.lock().unwrap();
            match *phase {
                SessionPhase::Idle | SessionPhase::Errored => *phase = SessionPhase::Sending,
                SessionPhase::Sending | SessionPhase::Streaming => {
                    return Ok(SendOutcome::Ignored);
                }
            }
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        // The user's message is visible before any network call begins.
        let (user_message_id, history) = {
            let mut conv = self.conversation.lock().unwrap();
            let id = conv.push(Role::User, text);
            let history = conv.history_before(&id);
            (id, history)
        };
        let _ = self.events.send(SessionEvent::UserMessage {
            message_id: user_message_id,
        });

        let memory = self.memory.lock().unwrap().clone();

        match self.run_turn(cancel, text, &tool, &memory, &history).await {
            Ok(assistant_id) => {
                self.pending.lock().unwrap().clear();
                *self.last_failed.lock().unwrap() = None;
                self.persist().await;
                *self.phase.lock().unwrap() = SessionPhase::Idle;
                let _ = self.events.send(SessionEvent::TurnCompleted {
                    message_id: assistant_id,
                });
                Ok(SendOutcome::Completed)
            }
            Err(e) if e.is_cancelled() => {
                // Partial content already streamed stays; nothing mutates
                // after this point.
                self.pending.lock().unwrap().clear();
                self.persist().await;
                *self.phase.lock().unwrap() = SessionPhase::Idle;
                let _ = self.events.send(SessionEvent::TurnCancelled);
                Ok(SendOutcome::Cancelled)
            }
            Err(e) => {
                *self.last_failed.lock().unwrap() = Some(LastSend {
                    text: text.to_string(),
                    tool,
                });
                *self.phase.lock().unwrap() = SessionPhase::Errored;
                let _ = self.events.send(SessionEvent::TurnFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Cancel the in-flight turn, if any. The transport is aborted at the
    /// next chunk boundary.
    pub fn cancel(&self) {
        let phase = *self.phase.lock().unwrap();
        if matches!(phase, SessionPhase::Sending | SessionPhase::Streaming) {
            self.cancel.lock().unwrap().cancel();
        }
    }

    /// Resubmit the input and tool of the turn that just failed.
    pub async fn retry_last(&self) -> Result<SendOutcome, ChatError> {
        let last = {
            if *self.phase.lock().unwrap() != SessionPhase::Errored {
                return Err(ChatError::Validation("no failed turn to retry".to_string()));
            }
            self.last_failed.lock().unwrap().clone()
        };

        let Some(last) = last else {
            return Err(ChatError::Validation("no failed turn to retry".to_string()));
        };

        self.set_tool(last.tool);
        self.send(&last.text).await
    }

    /// Attempt loop: linear backoff, cancellation exits immediately and is
    /// never counted against the budget.
    async fn run_turn(
        &self,
        cancel: CancellationToken,
        text: &str,
        tool: &str,
        memory: &AgentMemory,
        history: &[muse_protocol::WireMessage],
    ) -> Result<String, ChatError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .attempt_turn(cancel.clone(), text, tool, memory, history)
                .await
            {
                Ok(assistant_id) => return Ok(assistant_id),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(attempt, error = %e, "turn attempt failed, backing off");
                    let delay = self.config.base_delay * attempt;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: upload attachments, dispatch, stream into the
    /// placeholder. Returns the assistant message id on success.
    async fn attempt_turn(
        &self,
        cancel: CancellationToken,
        text: &str,
        tool: &str,
        memory: &AgentMemory,
        history: &[muse_protocol::WireMessage],
    ) -> Result<String, ChatError> {
        *self.phase.lock().unwrap() = SessionPhase::Sending;

        // Fresh uploads every attempt; object names never collide with a
        // previous attempt's.
        let pending = self.pending.lock().unwrap().clone();
        let attachments = if pending.is_empty() {
            Vec::new()
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                result = upload_batch(self.uploader.as_ref(), &pending) => result?,
            }
        };

        let request = ChatRequest {
            tool: tool.to_string(),
            message: text.to_string(),
            system_prompt: None,
            messages: history.to_vec(),
            memory: if memory.is_empty() {
                None
            } else {
                Some(memory.clone())
            },
            attachments,
            stream: self.config.streaming,
            conversation_id: Some(self.conversation.lock().unwrap().id.clone()),
            persist: self.config.request_persistence,
        };

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            result = self.transport.send_chat(&request) => result?,
        };

        // Entering Streaming: append the in-progress placeholder.
        *self.phase.lock().unwrap() = SessionPhase::Streaming;
        let assistant_id = self.conversation.lock().unwrap().push(Role::Assistant, "");
        let _ = self.events.send(SessionEvent::AssistantStarted {
            message_id: assistant_id.clone(),
        });

        let result = self
            .consume_stream(cancel, &mut stream, &assistant_id)
            .await;

        if let Err(e) = &result {
            // A retried attempt re-streams from scratch, so its partial
            // placeholder goes. Cancellation keeps whatever was rendered,
            // and a terminal failure keeps partial content but not an
            // empty bubble.
            let pop = !e.is_cancelled() && {
                let conv = self.conversation.lock().unwrap();
                e.is_retryable()
                    || conv
                        .messages
                        .last()
                        .is_some_and(|m| m.id == assistant_id && m.text.is_empty())
            };
            if pop {
                self.conversation.lock().unwrap().pop_if_last(&assistant_id);
            }
        }

        result.map(|()| assistant_id)
    }

    /// Apply stream events to the placeholder. Cancellation is checked at
    /// every chunk boundary; after it fires, no further mutation happens.
    async fn consume_stream(
        &self,
        cancel: CancellationToken,
        stream: &mut TurnStream,
        assistant_id: &str,
    ) -> Result<(), ChatError> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                event = stream.next_event() => match event {
                    None => return Ok(()),
                    Some(Ok(StreamEvent::Token { content, .. })) => {
                        if content.is_empty() {
                            continue;
                        }
                        self.conversation
                            .lock()
                            .unwrap()
                            .append_to(assistant_id, &content);
                        let _ = self.events.send(SessionEvent::Token {
                            message_id: assistant_id.to_string(),
                            delta: content,
                        });
                    }
                    Some(Ok(StreamEvent::Done)) => return Ok(()),
                    Some(Ok(StreamEvent::Error { message })) => {
                        return Err(ChatError::Upstream(message));
                    }
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    /// Local snapshot first (synchronously authoritative for this device),
    /// then the best-effort remote upsert. Failures are logged, never
    /// surfaced, and never block the chat flow.
    async fn persist(&self) {
        let payload = self.conversation.lock().unwrap().to_payload();

        if let Some(local) = &self.local
            && let Err(e) = local.save(&payload)
        {
            warn!(error = %e, conversation_id = %payload.id, "local conversation save failed");
        }

        if let Some(remote) = &self.remote
            && let Err(e) = remote.upsert(&payload).await
        {
            warn!(error = %e, conversation_id = %payload.id, "remote conversation sync failed");
        }
    }

    fn moderation_hit(&self, text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        self.config
            .denylist
            .iter()
            .find(|term| !term.is_empty() && lowered.contains(&term.to_lowercase()))
            .cloned()
    }
}

/// Attachment a tool insists on before it can run.
fn required_attachment(tool: &str) -> Option<AttachmentKind> {
    match tool {
        "clone" => Some(AttachmentKind::Video),
        _ => None,
    }
}
