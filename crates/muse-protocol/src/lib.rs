//! Canonical wire types for Muse chat streaming.
//!
//! This crate defines the protocol between the Muse client and the streaming
//! chat proxy: request payloads, the server's event framing, and the SSE
//! block parsing both sides use to consume event streams.

pub mod sse;
mod types;

pub use types::{
    AgentMemory, AttachmentKind, AttachmentRef, ChatRequest, ConversationPayload,
    ConversationSummary, MessagePayload, Role, StreamEvent, WireMessage, best_text,
};

/// Maximum number of prior wire messages the proxy retains when building the
/// upstream request. Older history is dropped server-side so request size
/// stays bounded regardless of conversation length.
pub const HISTORY_LIMIT: usize = 12;
