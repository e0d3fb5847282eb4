//! Disk-backed object storage for attachments.
//!
//! `put(path, bytes, upsert)` either writes the object and returns its
//! public URL, or fails with a distinct error per cause. A name collision
//! under `upsert = false` is its own variant; callers retry with a fresh
//! object name rather than treating it as a transport failure.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::settings::StorageSettings;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object already exists: {0}")]
    Conflict(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("object too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored object's location.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredObject {
    pub path: String,
    pub url: String,
}

/// Flat-namespace object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
    public_base_url: String,
    max_size: u64,
}

impl ObjectStore {
    pub fn new(settings: &StorageSettings) -> std::io::Result<Self> {
        std::fs::create_dir_all(&settings.root_dir)?;
        Ok(Self {
            root: settings.root_dir.clone(),
            public_base_url: settings.public_base_url.trim_end_matches('/').to_string(),
            max_size: settings.max_upload_size,
        })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Public URL for an object path.
    pub fn url_for(&self, object_path: &str) -> String {
        format!("{}/{}", self.public_base_url, object_path)
    }

    /// Write an object. Without `upsert`, an existing object of the same
    /// name is a conflict and nothing is written.
    pub async fn put(
        &self,
        object_path: &str,
        bytes: &[u8],
        upsert: bool,
    ) -> Result<StoredObject, StorageError> {
        let name = sanitize_object_name(object_path)
            .ok_or_else(|| StorageError::InvalidName(object_path.to_string()))?;

        if bytes.len() as u64 > self.max_size {
            return Err(StorageError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_size,
            });
        }

        let dest = self.root.join(&name);
        if !upsert && fs::try_exists(&dest).await? {
            return Err(StorageError::Conflict(name));
        }

        let mut file = fs::File::create(&dest).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        info!(object = %name, size = bytes.len(), "stored object");

        Ok(StoredObject {
            url: self.url_for(&name),
            path: name,
        })
    }

    /// Read an object back, with a guessed content type for serving.
    pub async fn read(&self, object_path: &str) -> Result<(Vec<u8>, String), StorageError> {
        let name = sanitize_object_name(object_path)
            .ok_or_else(|| StorageError::InvalidName(object_path.to_string()))?;
        let path = self.root.join(&name);

        match fs::read(&path).await {
            Ok(bytes) => Ok((bytes, content_type_for(&path))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Sanitize an object name into a single safe path component.
///
/// Rejects empty names and anything that would escape the storage root;
/// separators and shell-hostile characters are replaced rather than kept.
pub fn sanitize_object_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }

    let sanitized: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();

    let sanitized = sanitized.trim_matches(|c| c == '.' || c == ' ');
    if sanitized.is_empty() {
        return None;
    }

    if sanitized.len() > 255 {
        let mut cut = 255;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        return Some(sanitized[..cut].to_string());
    }

    Some(sanitized.to_string())
}
