use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MegaError, MegaResult};

/// Sentinel `chunks_pack_size` value: upload the whole file as one fragment.
pub const PACK_ALL_CHUNKS: i64 = -1;

/// Top-level client configuration (loaded from mega.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

/// Request layer settings. The crypto core never reads these; they are
/// carried so a transport built on top shares one config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API endpoint (default: https://g.api.mega.co.nz)
    pub base_url: String,
    /// Application key sent with every request
    pub application_key: Option<String>,
    /// Attempts before a request that keeps returning EAGAIN is abandoned
    pub request_attempts: u32,
    /// Initial delay between attempts in milliseconds
    pub request_delay_ms: u64,
    /// Upper bound for the exponential delay in milliseconds
    pub max_request_delay_ms: u64,
    /// Serialize API calls issued against one session
    pub synchronize_requests: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Target size of one upload fragment in bytes, or -1 to send everything at once
    pub chunks_pack_size: i64,
    /// Read buffer used when pumping a crypto stream (minimum 16)
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://g.api.mega.co.nz".into(),
            application_key: None,
            request_attempts: 60,
            request_delay_ms: 200,
            max_request_delay_ms: 6400,
            synchronize_requests: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunks_pack_size: 1024 * 1024,
            buffer_size: 64 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl ClientConfig {
    /// Reject values the transfer code cannot work with.
    pub fn validate(&self) -> MegaResult<()> {
        let transfer = &self.transfer;
        if transfer.buffer_size < 16 {
            return Err(MegaError::Config(format!(
                "transfer.buffer_size must be at least 16 bytes, got {}",
                transfer.buffer_size
            )));
        }
        if transfer.chunks_pack_size == 0 || transfer.chunks_pack_size < PACK_ALL_CHUNKS {
            return Err(MegaError::Config(format!(
                "transfer.chunks_pack_size must be positive or {PACK_ALL_CHUNKS}, got {}",
                transfer.chunks_pack_size
            )));
        }
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(MegaError::Config(format!(
                "logging.format must be \"json\" or \"text\", got {other:?}"
            ))),
        }
    }
}

/// Load a config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> MegaResult<ClientConfig> {
    if !path.exists() {
        tracing::warn!("config file not found: {}  (using defaults)", path.display());
        return Ok(ClientConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: ClientConfig = toml::from_str(&content)
        .map_err(|e| MegaError::Config(format!("parsing config {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}
