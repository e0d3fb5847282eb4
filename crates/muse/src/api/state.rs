//! Application state shared across handlers.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::auth::AuthState;
use crate::provider::ProviderClient;
use crate::settings::Settings;
use crate::storage::ObjectStore;
use crate::store::ConversationStore;

/// Shared, cheaply clonable server state. Holds configuration and the
/// long-lived clients; per-request state lives in the handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub auth: AuthState,
    pub provider: ProviderClient,
    pub objects: ObjectStore,
    /// Present only when persistence is enabled in settings.
    pub store: Option<ConversationStore>,
}

impl AppState {
    /// Build state from settings, opening the conversation database when
    /// persistence is enabled.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let auth = AuthState::new(&settings.auth);
        let provider = ProviderClient::new(&settings.provider)?;
        let objects = ObjectStore::new(&settings.storage).with_context(|| {
            format!(
                "preparing storage root: {}",
                settings.storage.root_dir.display()
            )
        })?;

        let store = if settings.persistence.enabled {
            Some(ConversationStore::open(&settings.persistence.database_path).await?)
        } else {
            None
        };

        Ok(Self {
            settings: Arc::new(settings),
            auth,
            provider,
            objects,
            store,
        })
    }

    /// The conversation store, or a configuration error when persistence
    /// was requested but never configured.
    pub fn require_store(&self) -> Result<&ConversationStore, crate::api::error::ApiError> {
        self.store.as_ref().ok_or_else(|| {
            crate::api::error::ApiError::internal(
                "persistence requested but no conversation database is configured",
            )
        })
    }
}
