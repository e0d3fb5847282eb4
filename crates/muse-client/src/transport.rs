//! Transport boundary between the session and the chat proxy.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde_json::Value;
use tracing::debug;

use muse_protocol::{ChatRequest, StreamEvent, best_text};

use crate::error::ChatError;

/// Bearer/API-key credentials applied to outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
            api_key: None,
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            bearer: None,
            api_key: Some(key.into()),
        }
    }

    pub(crate) fn apply(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key);
        }
        req
    }
}

/// The events of one chat turn, in arrival order.
///
/// Ends after a terminal event ([`StreamEvent::Done`] or
/// [`StreamEvent::Error`]) or when the underlying connection closes.
/// Dropping the stream aborts the in-flight request.
pub struct TurnStream {
    inner: BoxStream<'static, Result<StreamEvent, ChatError>>,
}

impl TurnStream {
    pub fn new(
        stream: impl futures::Stream<Item = Result<StreamEvent, ChatError>> + Send + 'static,
    ) -> Self {
        Self {
            inner: stream.boxed(),
        }
    }

    /// A stream with a fixed set of events, used for non-streaming
    /// responses and tests.
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        Self::new(stream::iter(events.into_iter().map(Ok)))
    }

    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, ChatError>> {
        self.inner.next().await
    }
}

/// How the session reaches the chat proxy.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Dispatch one chat request and return its event stream. For
    /// non-streaming requests implementations synthesize a single token
    /// plus `Done` from the JSON reply.
    async fn send_chat(&self, request: &ChatRequest) -> Result<TurnStream, ChatError>;
}

/// Production transport: JSON POST for non-streaming turns, SSE for
/// streaming ones.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    async fn send_streaming(&self, request: &ChatRequest) -> Result<TurnStream, ChatError> {
        let builder = self
            .credentials
            .apply(self.http.post(self.chat_url()))
            .header("Accept", "text/event-stream")
            .json(request);

        let es = EventSource::new(builder)
            .map_err(|e| ChatError::Transport(format!("failed to open stream: {e}")))?;

        Ok(event_stream(es))
    }

    async fn send_blocking(&self, request: &ChatRequest) -> Result<TurnStream, ChatError> {
        let response = self
            .credentials
            .apply(self.http.post(self.chat_url()))
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        // Resolve the reply across the shapes different server versions
        // use; fall back to the raw body so the user always sees something.
        let text = match serde_json::from_str::<Value>(&body) {
            Ok(value) => best_text(&value).unwrap_or(body),
            Err(_) => body,
        };

        Ok(TurnStream::from_events(vec![
            StreamEvent::token(text),
            StreamEvent::Done,
        ]))
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send_chat(&self, request: &ChatRequest) -> Result<TurnStream, ChatError> {
        if request.stream {
            self.send_streaming(request).await
        } else {
            self.send_blocking(request).await
        }
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> ChatError {
    let detail = error_detail(body).unwrap_or_else(|| format!("server returned {status}"));
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        ChatError::Auth(detail)
    } else {
        ChatError::Transport(detail)
    }
}

/// Pull a human-readable message out of an error response body.
fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    for key in ["error", "message"] {
        if let Some(text) = value.get(key).and_then(Value::as_str)
            && !text.is_empty()
        {
            return Some(text.to_string());
        }
    }
    None
}

/// Adapt an [`EventSource`] into a [`TurnStream`].
///
/// Out-of-band `event: error` blocks and in-band `{type: "error"}` payloads
/// both surface as [`StreamEvent::Error`]. Payloads that fail to parse are
/// skipped, mirroring the proxy's own local-failure isolation. The stream
/// closes itself after any terminal event so the event source never tries
/// to reconnect.
fn event_stream(es: EventSource) -> TurnStream {
    let inner = stream::unfold(Some(es), |state| async move {
        let mut es = state?;
        loop {
            match es.next().await {
                Some(Ok(SseEvent::Open)) => continue,
                Some(Ok(SseEvent::Message(msg))) => {
                    if msg.event == "error" {
                        es.close();
                        let message =
                            error_detail(&msg.data).unwrap_or_else(|| msg.data.clone());
                        return Some((Ok(StreamEvent::Error { message }), None));
                    }
                    match serde_json::from_str::<StreamEvent>(&msg.data) {
                        Ok(event) if event.is_terminal() => {
                            es.close();
                            return Some((Ok(event), None));
                        }
                        Ok(event) => return Some((Ok(event), Some(es))),
                        Err(e) => {
                            debug!(error = %e, "skipping unparseable stream payload");
                            continue;
                        }
                    }
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    es.close();
                    return None;
                }
                Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                    es.close();
                    let body = response.text().await.unwrap_or_default();
                    return Some((Err(status_error(status, &body)), None));
                }
                Some(Err(e)) => {
                    es.close();
                    return Some((Err(ChatError::Transport(e.to_string())), None));
                }
            }
        }
    });

    TurnStream::new(inner)
}
