//! Server configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `MUSE_`-prefixed environment variables (`MUSE_PROVIDER__API_KEY` maps to
//! `provider.api_key`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed by CORS. Empty means allow any (development).
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL of the OpenAI-compatible completion API.
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    /// Bearer key for the provider. Required for any chat operation.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Upper bound on one upstream call, connect through last byte.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret for validating caller bearer tokens.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Static keys accepted via the `apikey` header.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory uploaded objects are written to.
    #[serde(default = "default_storage_root")]
    pub root_dir: PathBuf,
    /// Prefix for URLs handed back to clients, e.g. "http://localhost:8089/uploads".
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8089
}

fn default_provider_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_storage_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muse")
        .join("uploads")
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:8089/uploads".to_string()
}

fn default_max_upload_size() -> u64 {
    50 * 1024 * 1024
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muse")
        .join("muse.db")
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: None,
            model: default_model(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
            public_base_url: default_public_base_url(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            database_path: default_database_path(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(Environment::with_prefix("MUSE").separator("__"))
            .build()
            .context("building configuration")?;

        config
            .try_deserialize::<Settings>()
            .context("deserializing configuration")
    }
}
