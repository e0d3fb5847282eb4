//! Attachment upload endpoints.

use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, instrument};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::CurrentUser;
use crate::storage::StoredObject;

/// Query parameters for the upload endpoint.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// Destination object name. Defaults to the multipart filename.
    pub path: Option<String>,
    /// Overwrite an existing object instead of failing with a conflict.
    #[serde(default)]
    pub upsert: bool,
}

/// POST /api/uploads
///
/// Accepts a single multipart file field and stores it under the requested
/// object name. A name collision without `upsert=true` answers 409 so the
/// caller can pick a fresh name and retry.
#[instrument(skip(state, user, multipart))]
pub async fn upload(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<StoredObject>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart error: {e}")))?
    {
        let file_name = field
            .file_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "upload".to_string());
        let object_path = query.path.clone().unwrap_or(file_name);

        let data = field.bytes().await.map_err(|e| {
            error!(error = %e, "failed to read upload body");
            ApiError::bad_request(format!("failed to read upload body: {e}"))
        })?;

        let stored = state.objects.put(&object_path, &data, query.upsert).await?;
        tracing::info!(user_id = %user.id(), object = %stored.path, "attachment uploaded");
        return Ok(Json(stored));
    }

    Err(ApiError::bad_request("no file in upload"))
}

/// GET /uploads/{*path}
///
/// Serves a stored object back. Unauthenticated: returned URLs are shared
/// into posts and must resolve without credentials.
#[instrument(skip(state))]
pub async fn serve_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let (bytes, content_type) = state.objects.read(&path).await?;
    Ok((
        [(header::CONTENT_TYPE, content_type)],
        Body::from(bytes),
    )
        .into_response())
}
