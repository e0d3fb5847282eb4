//! Client-side chat for the Muse app.
//!
//! The heart of this crate is [`ChatSession`]: it owns the conversation
//! state, enforces the one-turn-at-a-time rule, uploads attachments, drives
//! the streaming exchange with the proxy, and persists the conversation
//! locally and remotely once a turn completes.
//!
//! Transport and storage are traits so the session can be exercised without
//! a network; [`transport::HttpTransport`] and friends are the production
//! implementations.

mod conversation;
mod error;
pub mod session;
pub mod store;
pub mod transport;
pub mod uploader;

pub use conversation::{Attachment, Conversation, Message};
pub use error::ChatError;
pub use session::{ChatSession, SendOutcome, SessionConfig, SessionEvent, SessionPhase};
