//! The streaming chat proxy.
//!
//! Validates the caller's request, builds the upstream provider request
//! (system prompt, trimmed history, the new user message), then relays the
//! provider's stream back to the client re-framed as [`StreamEvent`]s. Each
//! token is flushed as soon as it is extracted; persistence is best-effort
//! and never interrupts the client-facing stream.

use std::convert::Infallible;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use muse_protocol::{AgentMemory, ChatRequest, HISTORY_LIMIT, Role, StreamEvent, WireMessage};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::auth::CurrentUser;
use crate::store::ConversationStore;

/// POST /api/chat
///
/// Streaming requests answer with `text/event-stream`; otherwise the full
/// completion is returned as `{"reply": …}` JSON.
#[instrument(skip(state, user, body))]
pub async fn chat(
    State(state): State<AppState>,
    user: CurrentUser,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("malformed request body: {e}")))?;

    info!(
        user_id = %user.id(),
        tool = %req.tool,
        message_len = req.message.len(),
        stream = req.stream,
        "chat request"
    );

    // Configuration problems surface as synchronous 500s before any
    // streaming begins.
    if !state.provider.is_configured() {
        return Err(ApiError::internal("provider API key not configured"));
    }

    let sink = if req.persist {
        let store = state.require_store()?.clone();
        let conversation_id = req
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Some(PersistSink::new(store, conversation_id, user.id().to_string()))
    } else {
        None
    };

    let messages = build_upstream_messages(&req);

    if req.stream {
        Ok(stream_response(state, messages, sink))
    } else {
        let reply = state.provider.complete(&messages).await?;
        if let Some(mut sink) = sink {
            sink.append(&reply).await;
        }
        Ok(Json(json!({ "reply": reply })).into_response())
    }
}

/// Relay the provider stream to the client as SSE.
fn stream_response(
    state: AppState,
    messages: Vec<WireMessage>,
    sink: Option<PersistSink>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    let provider = state.provider.clone();

    tokio::spawn(async move {
        let mut sink = sink;

        let mut stream = match provider.stream_chat(&messages).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "upstream call failed before streaming");
                let _ = send_event(&tx, &StreamEvent::error(e.to_string())).await;
                return;
            }
        };

        loop {
            match stream.next_delta().await {
                Ok(Some(delta)) => {
                    let event = StreamEvent::Token {
                        role: delta.role.unwrap_or(Role::Assistant),
                        content: delta.content.clone(),
                    };
                    if send_event(&tx, &event).await.is_err() {
                        // Client disconnected; stop reading upstream.
                        return;
                    }
                    if let Some(sink) = sink.as_mut() {
                        sink.append(&delta.content).await;
                    }
                }
                Ok(None) => {
                    let _ = send_event(&tx, &StreamEvent::Done).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "upstream stream failed");
                    let _ = send_event(&tx, &StreamEvent::error(e.to_string())).await;
                    return;
                }
            }
        }
    });

    Sse::new(tokio_stream::wrappers::ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn send_event(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    event: &StreamEvent,
) -> Result<(), ()> {
    let Ok(sse_event) = Event::default().json_data(event) else {
        return Ok(());
    };
    tx.send(Ok(sse_event)).await.map_err(|_| ())
}

/// Assemble the upstream message list: system prompt, trimmed history, then
/// the new user message.
fn build_upstream_messages(req: &ChatRequest) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(req.messages.len().min(HISTORY_LIMIT) + 2);

    messages.push(WireMessage {
        role: Role::System,
        content: build_system_prompt(&req.tool, req.system_prompt.as_deref(), req.memory.as_ref()),
    });

    let skip = req.messages.len().saturating_sub(HISTORY_LIMIT);
    messages.extend(req.messages.iter().skip(skip).cloned());

    messages.push(WireMessage {
        role: Role::User,
        content: user_content(req),
    });

    messages
}

/// Combine the tool's base instruction with memory clauses, in the fixed
/// order style, voice, tone. Deterministic for a given request.
fn build_system_prompt(
    tool: &str,
    override_prompt: Option<&str>,
    memory: Option<&AgentMemory>,
) -> String {
    let mut prompt = match override_prompt {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => base_instruction(tool).to_string(),
    };

    if let Some(memory) = memory {
        if !memory.saved_style.is_empty() {
            prompt.push_str(&format!(
                " Write in the user's saved style: {}.",
                memory.saved_style
            ));
        }
        if !memory.my_voice.is_empty() {
            prompt.push_str(&format!(" Match the creator's voice: {}.", memory.my_voice));
        }
        if !memory.brand_tone.is_empty() {
            prompt.push_str(&format!(" Keep the brand tone: {}.", memory.brand_tone));
        }
    }

    prompt
}

fn base_instruction(tool: &str) -> &'static str {
    match tool {
        "caption" => {
            "You write short, engaging captions for social posts. Offer a few options."
        }
        "clone" => {
            "You help creators remix an existing video into a new script in their own style."
        }
        _ => "You are Muse, a creative assistant inside a social app. Be concise and practical.",
    }
}

/// The user message content, with attachment references appended so a
/// text-only provider still sees what was shared.
fn user_content(req: &ChatRequest) -> String {
    let mut content = req.message.clone();
    for attachment in &req.attachments {
        content.push_str(&format!(
            "\n[attached {}: {}]",
            attachment.kind.as_str(),
            attachment.url
        ));
    }
    content
}

/// Best-effort persistence of the streamed assistant reply.
///
/// Inserts one row at the first token and appends subsequent content.
/// Any failure disables the sink for the rest of the turn; the client
/// stream is never affected.
struct PersistSink {
    store: ConversationStore,
    conversation_id: String,
    user_id: String,
    message_id: Option<String>,
    disabled: bool,
}

impl PersistSink {
    fn new(store: ConversationStore, conversation_id: String, user_id: String) -> Self {
        Self {
            store,
            conversation_id,
            user_id,
            message_id: None,
            disabled: false,
        }
    }

    async fn append(&mut self, delta: &str) {
        if self.disabled {
            return;
        }

        if self.message_id.is_none() {
            let now_ms = Utc::now().timestamp_millis();
            let id = Uuid::new_v4().to_string();

            if let Err(e) = self
                .store
                .ensure_conversation(&self.conversation_id, Some(&self.user_id), now_ms)
                .await
            {
                warn!(error = %e, conversation_id = %self.conversation_id, "persistence disabled for turn");
                self.disabled = true;
                return;
            }
            if let Err(e) = self
                .store
                .insert_stream_row(&self.conversation_id, &id, Role::Assistant, now_ms)
                .await
            {
                warn!(error = %e, conversation_id = %self.conversation_id, "persistence disabled for turn");
                self.disabled = true;
                return;
            }
            self.message_id = Some(id);
        }

        let Some(message_id) = self.message_id.as_deref() else {
            return;
        };
        if let Err(e) = self.store.append_stream_content(message_id, delta).await {
            warn!(error = %e, message_id = %message_id, "dropping streamed persistence");
            self.disabled = true;
        }
    }
}
