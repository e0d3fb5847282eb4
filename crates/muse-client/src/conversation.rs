//! Conversation state owned by the client.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use muse_protocol::{AttachmentKind, ConversationPayload, MessagePayload, Role, WireMessage};

/// Longest title derived from a first message, in characters.
const TITLE_MAX_CHARS: usize = 40;

/// One message in the conversation.
///
/// The trailing assistant message is the only entity mutated after
/// creation: its `text` grows in place while tokens stream in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl Message {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// An ordered, append-only message log with a derived title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message. The first message also names the conversation.
    pub fn push(&mut self, role: Role, text: impl Into<String>) -> String {
        let message = Message::new(role, text);
        if self.messages.is_empty() {
            self.title = derive_title(&message.text);
        }
        let id = message.id.clone();
        self.messages.push(message);
        self.updated_at = Utc::now().timestamp_millis();
        id
    }

    /// Append streamed content to the trailing message.
    ///
    /// Only the last message may be in progress, so growth is always at the
    /// tail; a stray call with an id that is not the tail is ignored.
    pub fn append_to(&mut self, message_id: &str, delta: &str) {
        if let Some(last) = self.messages.last_mut()
            && last.id == message_id
        {
            last.text.push_str(delta);
            self.updated_at = Utc::now().timestamp_millis();
        }
    }

    /// Drop the message with the given id if it is the trailing one.
    pub fn pop_if_last(&mut self, message_id: &str) {
        if self.messages.last().is_some_and(|m| m.id == message_id) {
            self.messages.pop();
        }
    }

    /// Wire history for a new turn: every message before the given one.
    pub fn history_before(&self, message_id: &str) -> Vec<WireMessage> {
        self.messages
            .iter()
            .take_while(|m| m.id != message_id)
            .map(|m| WireMessage {
                role: m.role,
                content: m.text.clone(),
            })
            .collect()
    }

    pub fn to_payload(&self) -> ConversationPayload {
        ConversationPayload {
            id: self.id.clone(),
            title: self.title.clone(),
            messages: self
                .messages
                .iter()
                .map(|m| MessagePayload {
                    id: m.id.clone(),
                    role: m.role,
                    content: m.text.clone(),
                    created_at: m.created_at,
                })
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn from_payload(payload: ConversationPayload) -> Self {
        Self {
            id: payload.id,
            title: payload.title,
            messages: payload
                .messages
                .into_iter()
                .map(|m| Message {
                    id: m.id,
                    role: m.role,
                    text: m.content,
                    created_at: m.created_at,
                })
                .collect(),
            created_at: payload.created_at,
            updated_at: payload.updated_at,
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending attachment, held in the send buffer until the turn completes
/// or is cancelled.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            filename: filename.into(),
            bytes,
        }
    }
}

/// Title for a conversation: its first message, truncated on a character
/// boundary with an ellipsis.
fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push('\u{2026}');
    }
    title
}
