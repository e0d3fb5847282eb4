//! Conversation persistence.
//!
//! Local snapshots are the authoritative copy for this device and are
//! written synchronously before any remote write is attempted, so a remote
//! failure can never lose local state. The remote upsert is keyed by
//! conversation id and is the source of truth for cross-device read-back.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{from_reader, to_writer_pretty};

use muse_protocol::{ConversationPayload, ConversationSummary};

use crate::error::ChatError;
use crate::transport::Credentials;

/// On-device snapshot store: one JSON file per conversation.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ChatError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ChatError::Persistence(format!("creating {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Replace the snapshot for a conversation. Writes to a temp file and
    /// renames so a crash mid-write cannot corrupt the previous snapshot.
    pub fn save(&self, conversation: &ConversationPayload) -> Result<(), ChatError> {
        let final_path = self.path_for(&conversation.id);
        let tmp_path = final_path.with_extension("json.tmp");

        let file = File::create(&tmp_path)
            .map_err(|e| ChatError::Persistence(format!("creating snapshot: {e}")))?;
        to_writer_pretty(BufWriter::new(file), conversation)
            .map_err(|e| ChatError::Persistence(format!("writing snapshot: {e}")))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| ChatError::Persistence(format!("replacing snapshot: {e}")))?;

        Ok(())
    }

    /// Load a conversation by id, or `None` if no snapshot exists.
    pub fn load(&self, id: &str) -> Result<Option<ConversationPayload>, ChatError> {
        let path = self.path_for(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ChatError::Persistence(format!(
                    "opening {}: {e}",
                    path.display()
                )));
            }
        };

        from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|e| ChatError::Persistence(format!("parsing snapshot: {e}")))
    }
}

/// Remote side of conversation persistence.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Authoritative upsert of the full conversation, keyed by id.
    async fn upsert(&self, conversation: &ConversationPayload) -> Result<(), ChatError>;
}

/// Production remote sync against the Muse conversation API.
pub struct HttpRemoteSync {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpRemoteSync {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }
}

impl HttpRemoteSync {
    /// List the caller's conversations, newest first.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        let url = format!("{}/api/conversations", self.base_url);
        let response = self
            .credentials
            .apply(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;

        response
            .error_for_status()
            .map_err(|e| ChatError::Persistence(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChatError::Persistence(format!("bad listing response: {e}")))
    }

    /// Fetch one conversation by id, or `None` when the backend has no
    /// record of it.
    pub async fn fetch(&self, id: &str) -> Result<Option<ConversationPayload>, ChatError> {
        let url = format!("{}/api/conversations/{id}", self.base_url);
        let response = self
            .credentials
            .apply(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        response
            .error_for_status()
            .map_err(|e| ChatError::Persistence(e.to_string()))?
            .json()
            .await
            .map(Some)
            .map_err(|e| ChatError::Persistence(format!("bad conversation response: {e}")))
    }
}

#[async_trait]
impl RemoteSync for HttpRemoteSync {
    async fn upsert(&self, conversation: &ConversationPayload) -> Result<(), ChatError> {
        let url = format!("{}/api/conversations/{}", self.base_url, conversation.id);
        let response = self
            .credentials
            .apply(self.http.put(&url))
            .json(conversation)
            .send()
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Persistence(format!(
                "upsert failed ({status}): {body}"
            )));
        }

        Ok(())
    }
}
