//! Configuration management for Atelier services.
//!
//! Configuration lives in a single JSON file (`atelier.json` next to the
//! binary, or the path in `ATELIER_CONFIG`).
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (ATELIER_* prefix)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ATELIER_BIND` → server.bind
//! - `ATELIER_PORT` → server.port
//! - `ATELIER_LOG_LEVEL` → observability.log_level
//! - `ATELIER_DATA_DIR` → storage.data_dir
//! - `ATELIER_FACE_URL` → face.base_url
//! - `OPENAI_API_KEY` → llm.api_key

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var("ATELIER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("atelier.json"))
}

// ============================================================================
// Server Configuration
// ============================================================================

/// HTTP/WS listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Default: "127.0.0.1" (local only).
    /// Set to "0.0.0.0" so capture stations on the exhibit LAN can reach us.
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listener port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4500
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// On-disk layout for personas, uploads and the motion corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    /// Directory holding one JSON persona record per session.
    pub fn persona_dir(&self) -> PathBuf {
        self.data_dir.join("personas")
    }

    /// Directory holding renamed upload files.
    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

// ============================================================================
// Motion Corpus Configuration
// ============================================================================

/// Motion corpus source files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    /// Primary corpus CSV.
    #[serde(default = "default_corpus_path")]
    pub path: PathBuf,

    /// Fallback corpus CSV, used when the primary yields zero usable rows.
    #[serde(default = "default_corpus_fallback_path")]
    pub fallback_path: PathBuf,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: default_corpus_path(),
            fallback_path: default_corpus_fallback_path(),
        }
    }
}

fn default_corpus_path() -> PathBuf {
    PathBuf::from("data/motion_corpus.csv")
}

fn default_corpus_fallback_path() -> PathBuf {
    PathBuf::from("data/motion_corpus_default.csv")
}

// ============================================================================
// LLM Configuration
// ============================================================================

/// Language model and embedding collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// API key. Usually injected via `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model for text-only chat and evolution calls.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Model for the image-conditioned persona build.
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    /// Embedding model for the motion corpus.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Timeout for chat/vision calls, in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Timeout for embedding calls, in seconds.
    #[serde(default = "default_embedding_timeout")]
    pub embedding_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            chat_model: default_chat_model(),
            vision_model: default_vision_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_llm_timeout(),
            embedding_timeout_secs: default_embedding_timeout(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".into()
}

fn default_vision_model() -> String {
    "gpt-4o".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_embedding_timeout() -> u64 {
    20
}

// ============================================================================
// Face Service Configuration
// ============================================================================

/// Face-recognition collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceConfig {
    /// Face service base URL. Empty disables verification.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Timeout for verification calls, in seconds.
    #[serde(default = "default_face_timeout")]
    pub timeout_secs: u64,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_face_timeout(),
        }
    }
}

fn default_face_timeout() -> u64 {
    10
}

// ============================================================================
// Relay Configuration
// ============================================================================

/// Realtime relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Grace window between `session_end` and `session_autoreset`, in seconds.
    #[serde(default = "default_autoreset_delay")]
    pub autoreset_delay_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            autoreset_delay_secs: default_autoreset_delay(),
        }
    }
}

fn default_autoreset_delay() -> u64 {
    10
}

// ============================================================================
// Forwarding Configuration
// ============================================================================

/// Upload mirror forwarding. Fire-and-forget; failures are logged only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForwardConfig {
    /// URLs that receive a copy of each upload event.
    #[serde(default)]
    pub upload_mirrors: Vec<String>,
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the Atelier server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub corpus: CorpusConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub face: FaceConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub forward: ForwardConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("ATELIER_BIND") {
            self.server.bind = bind;
        }
        if let Ok(port) = std::env::var("ATELIER_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(level) = std::env::var("ATELIER_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(dir) = std::env::var("ATELIER_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("ATELIER_FACE_URL") {
            self.face.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
    }
}
