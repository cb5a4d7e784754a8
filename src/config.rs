use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub deployment: DeploymentConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeploymentConfig {
    /// `cloud` (shallow extraction only) or `local` (full extraction).
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "cloud".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Directory holding uploaded raw files awaiting full processing.
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("./data/raw")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Enables the local-side worker loop. The cloud side only needs
    /// `api_key` to serve the sync endpoints.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cloud_url: Option<String>,
    /// Shared secret; sent as a bearer token by the worker and checked by
    /// the cloud's sync endpoints.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
    /// Age beyond which a `processing` document counts as stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cloud_url: None,
            api_key: None,
            interval_secs: default_interval_secs(),
            batch_limit: default_batch_limit(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    900
}
fn default_batch_limit() -> i64 {
    100
}
fn default_stuck_after_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `ollama`, `openai`, `groq`, or `disabled`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_groq_model")]
    pub groq_model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            ollama_base_url: default_ollama_base_url(),
            openai_model: default_openai_model(),
            groq_model: default_groq_model(),
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
        }
    }
}

fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_model() -> String {
    "llama3.2".to_string()
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_groq_model() -> String {
    "llama-3.1-8b-instant".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_llm_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `ollama`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            base_url: None,
            api_key: None,
            dims: None,
            max_retries: default_embedding_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LimitsConfig {
    /// Upload ceiling in MB; defaults to 10 on cloud and 50 on local.
    #[serde(default)]
    pub max_upload_mb: Option<u64>,
}

impl Config {
    pub fn is_local(&self) -> bool {
        self.deployment.mode == "local"
    }

    pub fn max_upload_bytes(&self) -> u64 {
        let mb = self
            .limits
            .max_upload_mb
            .unwrap_or(if self.is_local() { 50 } else { 10 });
        mb * 1024 * 1024
    }
}

impl SyncConfig {
    /// True when the cloud side can authenticate sync requests.
    pub fn serves_sync(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate deployment
    match config.deployment.mode.as_str() {
        "cloud" | "local" => {}
        other => anyhow::bail!(
            "Unknown deployment mode: '{}'. Must be cloud or local.",
            other
        ),
    }

    // Validate sync
    if config.sync.interval_secs == 0 {
        anyhow::bail!("sync.interval_secs must be > 0");
    }
    if config.sync.batch_limit < 1 {
        anyhow::bail!("sync.batch_limit must be >= 1");
    }
    if config.sync.enabled {
        if config
            .sync
            .cloud_url
            .as_deref()
            .map_or(true, |u| u.is_empty())
        {
            anyhow::bail!("sync.cloud_url must be set when sync.enabled = true");
        }
        if !config.sync.serves_sync() {
            anyhow::bail!("sync.api_key must be set when sync.enabled = true");
        }
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "ollama" | "openai" | "groq" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be ollama, openai, groq, or disabled.",
            other
        ),
    }
    if matches!(config.llm.provider.as_str(), "openai" | "groq")
        && config
            .llm
            .api_key
            .as_deref()
            .map_or(true, |k| k.is_empty())
    {
        anyhow::bail!(
            "llm.api_key must be set when provider is '{}'",
            config.llm.provider
        );
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.limits.max_upload_mb == Some(0) {
        anyhow::bail!("limits.max_upload_mb must be > 0");
    }

    Ok(config)
}

/// Starter configuration written by `resil init`.
pub fn example_config() -> &'static str {
    r#"# resilience-pipeline configuration

[deployment]
# "cloud": shallow extraction only; deep work is queued for a local instance.
# "local": full extraction (Office documents, HTML, structured sections).
mode = "cloud"

[storage]
db_path = "./data/resilience.db"
raw_dir = "./data/raw"

[server]
bind = "127.0.0.1:8080"

[sync]
# Local side: set enabled = true plus cloud_url to run `resil worker`.
# Cloud side: set api_key to serve the /api/sync endpoints.
enabled = false
# cloud_url = "https://resilience.example.org"
# api_key = "change-me"
interval_secs = 900
batch_limit = 100
stuck_after_secs = 3600

[llm]
# ollama | openai | groq | disabled
provider = "ollama"
model = "llama3.2"
ollama_base_url = "http://localhost:11434"
# api_key = "sk-..."        # required for openai / groq
timeout_secs = 120
max_retries = 2

[embedding]
# openai | ollama | disabled
provider = "disabled"
# model = "text-embedding-3-small"
# dims = 1536

[limits]
# max_upload_mb = 10
"#
}
