//! Client-side error taxonomy.

use thiserror::Error;

/// Everything that can go wrong during a chat turn.
///
/// The session's retry loop keys off [`ChatError::is_retryable`].
/// Cancellation has its own variant and is never treated as a failure.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Bad or missing input. Surfaced immediately, never retried.
    #[error("{0}")]
    Validation(String),

    /// The message tripped the content-moderation pre-check.
    #[error("message blocked by content filter: {0}")]
    Moderation(String),

    /// Missing or rejected credentials. Never retried.
    #[error("not signed in: {0}")]
    Auth(String),

    /// Attachment upload failed. Retried as part of the whole send.
    #[error("attachment upload failed: {0}")]
    Upload(String),

    /// Couldn't reach the proxy, or it answered with a failure status.
    #[error("network error: {0}")]
    Transport(String),

    /// The provider rejected or errored; forwarded by the proxy as a
    /// terminal stream error.
    #[error("assistant error: {0}")]
    Upstream(String),

    /// The user (or a timeout) cancelled the turn. Never retried, never
    /// counted against the retry budget.
    #[error("cancelled")]
    Cancelled,

    /// Conversation save failed. Logged only, never surfaced mid-chat.
    #[error("failed to save conversation: {0}")]
    Persistence(String),
}

impl ChatError {
    /// Whether the send loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Upload(_) | ChatError::Transport(_) | ChatError::Upstream(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}
