//! Request and event types shared between client and proxy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single message as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

/// Flat per-session context injected into the system prompt.
///
/// All fields are free text; empty fields contribute nothing to the prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMemory {
    #[serde(default)]
    pub saved_style: String,
    #[serde(default)]
    pub my_voice: String,
    #[serde(default)]
    pub brand_tone: String,
}

impl AgentMemory {
    pub fn is_empty(&self) -> bool {
        self.saved_style.is_empty() && self.my_voice.is_empty() && self.brand_tone.is_empty()
    }
}

/// Kind of an uploaded attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
        }
    }
}

/// Reference to an already-uploaded attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
}

/// Request body for POST /api/chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Tool the user has selected (e.g. "chat", "caption", "clone").
    #[serde(default)]
    pub tool: String,
    /// The new user message for this turn.
    #[serde(default)]
    pub message: String,
    /// Optional client-supplied system prompt override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Prior conversation history, oldest first. The proxy keeps at most
    /// [`crate::HISTORY_LIMIT`] entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<AgentMemory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    /// Whether the caller wants a streamed response.
    #[serde(default)]
    pub stream: bool,
    /// Conversation to attribute persisted rows to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Ask the proxy to best-effort persist tokens as they are produced.
    #[serde(default)]
    pub persist: bool,
}

/// Server-to-client event framing for the streaming response.
///
/// A stream is zero or more `Token` events followed by exactly one terminal
/// event, either `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Incremental assistant output. `content` is always non-empty.
    Token {
        #[serde(default = "default_token_role")]
        role: Role,
        content: String,
    },
    /// Terminal failure. No further events follow.
    Error { message: String },
    /// Normal end of stream.
    Done,
}

fn default_token_role() -> Role {
    Role::Assistant
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        StreamEvent::Token {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token { .. })
    }
}

/// Full conversation snapshot as exchanged with the store API.
///
/// This is the authoritative-upsert payload: the client PUTs the whole
/// conversation keyed by id, and reads back the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub id: String,
    pub title: String,
    pub messages: Vec<MessagePayload>,
    /// Unix milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// One persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

/// Summary row for conversation listings, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: i64,
}

/// Keys tried, in order, when resolving the reply text of a non-streaming
/// response. Each key is also tried one level under `data`.
const BEST_TEXT_KEYS: [&str; 5] = ["reply", "message", "content", "output", "text"];

/// Resolve the "best text" of a non-streaming response body.
///
/// Returns the first non-empty string found under one of the known keys,
/// checking the top level and then a `data` wrapper. Falls back to `None`
/// when nothing matches; callers surface the raw body in that case.
pub fn best_text(body: &Value) -> Option<String> {
    for scope in [Some(body), body.get("data")].into_iter().flatten() {
        for key in BEST_TEXT_KEYS {
            if let Some(text) = scope.get(key).and_then(Value::as_str)
                && !text.is_empty()
            {
                return Some(text.to_string());
            }
        }
    }
    None
}
