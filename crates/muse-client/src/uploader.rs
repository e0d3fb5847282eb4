//! Attachment upload boundary.

use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use uuid::Uuid;

use muse_protocol::AttachmentRef;

use crate::conversation::Attachment;
use crate::error::ChatError;
use crate::transport::Credentials;

/// How many uploads may run at once within a batch.
const UPLOAD_PARALLELISM: usize = 4;

/// A stored object, as reported by the storage side.
#[derive(Debug, Clone)]
pub struct UploadedObject {
    pub path: String,
    pub url: String,
}

/// Uploads one object and returns its stable URL.
///
/// Uploads are never upserts: a retried attempt must use a fresh object
/// path, otherwise the storage side rejects the name collision.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(
        &self,
        object_path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadedObject, ChatError>;
}

/// Upload a batch of pending attachments with bounded parallelism.
///
/// Order of the returned refs matches the input. Any single failure aborts
/// the batch; no partial attachment set ever reaches a chat request. Each
/// call generates fresh object names, so retrying a failed send re-uploads
/// without colliding with the previous attempt's objects.
pub async fn upload_batch(
    uploader: &dyn AttachmentUploader,
    attachments: &[Attachment],
) -> Result<Vec<AttachmentRef>, ChatError> {
    futures::stream::iter(attachments.iter().map(|attachment| {
        let object_path = format!("{}-{}", Uuid::new_v4(), attachment.filename);
        let content_type = mime_guess::from_path(&attachment.filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        async move {
            let stored = uploader
                .upload(&object_path, &attachment.bytes, &content_type)
                .await?;
            Ok(AttachmentRef {
                kind: attachment.kind,
                url: stored.url,
            })
        }
    }))
    .buffered(UPLOAD_PARALLELISM)
    .try_collect()
    .await
}

/// Production uploader: multipart POST to the Muse upload endpoint.
pub struct HttpUploader {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpUploader {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl AttachmentUploader for HttpUploader {
    async fn upload(
        &self,
        object_path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadedObject, ChatError> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(object_path.to_string())
            .mime_str(content_type)
            .map_err(|e| ChatError::Upload(format!("invalid content type: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!(
            "{}/api/uploads?path={}",
            self.base_url,
            urlencode(object_path)
        );
        let response = self
            .credentials
            .apply(self.http.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A 409 means the object name is taken; callers retry with a
            // fresh name rather than treating this as a transport fault.
            return Err(ChatError::Upload(format!(
                "storage rejected {object_path} ({status}): {body}"
            )));
        }

        #[derive(serde::Deserialize)]
        struct StoredResponse {
            path: String,
            url: String,
        }

        let stored: StoredResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Upload(format!("bad upload response: {e}")))?;

        Ok(UploadedObject {
            path: stored.path,
            url: stored.url,
        })
    }
}

/// Minimal percent-encoding for an object name in a query value.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use muse_protocol::AttachmentKind;
    use std::sync::Mutex;

    struct RecordingUploader {
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl AttachmentUploader for RecordingUploader {
        async fn upload(
            &self,
            object_path: &str,
            _bytes: &[u8],
            _content_type: &str,
        ) -> Result<UploadedObject, ChatError> {
            self.calls.lock().unwrap().push(object_path.to_string());
            if let Some(fail) = &self.fail_on
                && object_path.ends_with(fail.as_str())
            {
                return Err(ChatError::Upload("storage unavailable".into()));
            }
            Ok(UploadedObject {
                path: object_path.to_string(),
                url: format!("http://cdn/{object_path}"),
            })
        }
    }

    fn attachment(name: &str) -> Attachment {
        Attachment::new(AttachmentKind::Image, name, vec![1, 2, 3])
    }

    #[tokio::test]
    async fn batch_preserves_order_and_freshens_names() {
        let uploader = RecordingUploader {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        };
        let attachments = vec![attachment("a.png"), attachment("b.png")];

        let refs = upload_batch(&uploader, &attachments).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs[0].url.ends_with("a.png"));
        assert!(refs[1].url.ends_with("b.png"));

        // Run again: object names must differ between attempts.
        let _ = upload_batch(&uploader, &attachments).await.unwrap();
        let calls = uploader.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_ne!(calls[0], calls[2]);
    }

    #[tokio::test]
    async fn one_failure_aborts_the_batch() {
        let uploader = RecordingUploader {
            calls: Mutex::new(Vec::new()),
            fail_on: Some("b.png".to_string()),
        };
        let attachments = vec![attachment("a.png"), attachment("b.png")];

        let err = upload_batch(&uploader, &attachments).await.unwrap_err();
        assert!(matches!(err, ChatError::Upload(_)));
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b+c.png"), "a%20b%2Bc.png");
        assert_eq!(urlencode("simple-name_1.png"), "simple-name_1.png");
    }
}
