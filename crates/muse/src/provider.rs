//! Upstream language-model provider client.
//!
//! Speaks the OpenAI-compatible chat completion API: a POST with
//! `{model, messages, stream}` and a bearer key, answered either by a single
//! JSON body or by an SSE stream of `choices[0].delta` fragments terminated
//! by a `[DONE]` sentinel.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use muse_protocol::sse::{BlockBuffer, SseBlock};
use muse_protocol::{Role, WireMessage};

use crate::settings::ProviderSettings;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The server is missing configuration required for this call.
    #[error("provider not configured: {0}")]
    Config(String),

    /// The provider rejected the request outright.
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Network-level failure reaching the provider or reading its stream.
    #[error("provider transport error: {0}")]
    Transport(String),

    /// The provider answered 2xx but the body had none of the expected shape.
    #[error("unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    stream: bool,
}

/// One incremental content fragment extracted from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub role: Option<Role>,
    pub content: String,
}

/// Client for the configured completion provider.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl ProviderClient {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }

    /// Whether the client has the credentials needed to reach the provider.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Config("provider API key not set".to_string()))
    }

    async fn post_completion(
        &self,
        messages: &[WireMessage],
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
                stream,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        Ok(response)
    }

    /// Open a streaming completion. Fails before any event is produced if
    /// the provider rejects the request.
    pub async fn stream_chat(
        &self,
        messages: &[WireMessage],
    ) -> Result<CompletionStream, ProviderError> {
        let response = self.post_completion(messages, true).await?;
        Ok(CompletionStream {
            inner: Box::pin(response.bytes_stream()),
            buffer: BlockBuffer::new(),
            finished: false,
        })
    }

    /// Run a non-streaming completion and return the full reply text.
    pub async fn complete(&self, messages: &[WireMessage]) -> Result<String, ProviderError> {
        let response = self.post_completion(messages, false).await?;
        let body: Value = response.json().await?;

        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::UnexpectedResponse(body.to_string()))
    }
}

/// Forward-only reader over the provider's SSE stream.
///
/// Buffering is bounded by one block at a time. Malformed blocks are logged
/// and skipped so one bad chunk never takes down the whole stream; only
/// transport failures are surfaced as errors.
pub struct CompletionStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: BlockBuffer,
    finished: bool,
}

impl CompletionStream {
    /// Next content fragment, or `None` once the stream has ended (either a
    /// `[DONE]` sentinel or the connection closing normally).
    pub async fn next_delta(&mut self) -> Result<Option<Delta>, ProviderError> {
        loop {
            if self.finished {
                return Ok(None);
            }

            while let Some(block) = self.buffer.next_block() {
                if let Some(delta) = self.handle_block(block) {
                    return Ok(Some(delta));
                }
                if self.finished {
                    return Ok(None);
                }
            }

            match self.inner.next().await {
                Some(Ok(bytes)) => self.buffer.push(&bytes),
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e.into());
                }
                None => {
                    self.finished = true;
                    // A trailing unterminated block still gets a chance.
                    if let Some(block) = self.buffer.finish()
                        && let Some(delta) = self.handle_block(block)
                    {
                        return Ok(Some(delta));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn handle_block(
        &mut self,
        block: Result<SseBlock, std::string::FromUtf8Error>,
    ) -> Option<Delta> {
        let block = match block {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "skipping non-UTF-8 stream block");
                return None;
            }
        };

        if block.is_done_sentinel() {
            self.finished = true;
            return None;
        }

        match parse_delta(&block.data) {
            Some(delta) => Some(delta),
            None => {
                warn!(payload = %truncate(&block.data, 120), "skipping malformed stream chunk");
                None
            }
        }
    }
}

/// Extract the delta from one `data:` payload.
///
/// Returns `None` for payloads that don't parse or carry no content, which
/// callers treat as skippable.
fn parse_delta(data: &str) -> Option<Delta> {
    let value: Value = serde_json::from_str(data).ok()?;
    let delta = value.get("choices")?.get(0)?.get("delta")?;

    let content = delta.get("content").and_then(Value::as_str)?;
    if content.is_empty() {
        return None;
    }

    let role = delta
        .get("role")
        .and_then(Value::as_str)
        .and_then(|r| match r {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        });

    Some(Delta {
        role,
        content: content.to_string(),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
