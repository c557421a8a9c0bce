//! Configuration for elohim-blockservice

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BlockServiceError, Result};
use crate::remote::PACK_ROTATION_THRESHOLD;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-blockservice")
}

/// Tunables the orchestrator reads on every call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Skip uploads of blocks the placement index already knows
    pub check_first: bool,
    /// Report CDN bandwidth to the pinning service
    pub dedicated_gateway: bool,
    /// Pack size after which the next write starts a new pack
    pub pack_rotation_bytes: u64,
    /// Files sent per upload/append request
    pub max_files_per_request: usize,
    /// Append requests in flight for one batch
    pub max_concurrent_uploads: usize,
    /// Placement lookups in flight for one batch read
    pub max_concurrent_lookups: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            check_first: true,
            dedicated_gateway: false,
            pack_rotation_bytes: PACK_ROTATION_THRESHOLD,
            max_files_per_request: 32,
            max_concurrent_uploads: 4,
            max_concurrent_lookups: 8,
        }
    }
}

/// Configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// CDN uploader base URL
    #[serde(default)]
    pub uploader_url: String,

    /// Pinning service base URL (usage metering)
    #[serde(default)]
    pub pinning_service_url: String,

    /// API key sent with usage reports
    #[serde(default)]
    pub api_key: String,

    /// Dedicated gateway mode: meter CDN bandwidth
    #[serde(default)]
    pub dedicated_gateway: bool,

    /// Storage directory for the placement index and block cache
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Deduplicate writes against the placement index
    #[serde(default = "default_true")]
    pub check_first: bool,

    /// Pack rotation threshold in bytes
    #[serde(default = "default_rotation")]
    pub pack_rotation_bytes: u64,

    #[serde(default = "default_files_per_request")]
    pub max_files_per_request: usize,

    #[serde(default = "default_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    #[serde(default = "default_concurrent_lookups")]
    pub max_concurrent_lookups: usize,

    /// HTTP timeout for CDN and pinning service requests
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_rotation() -> u64 {
    PACK_ROTATION_THRESHOLD
}

fn default_files_per_request() -> usize {
    32
}

fn default_concurrent_uploads() -> usize {
    4
}

fn default_concurrent_lookups() -> usize {
    8
}

fn default_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uploader_url: String::new(),
            pinning_service_url: String::new(),
            api_key: String::new(),
            dedicated_gateway: false,
            storage_dir: default_storage_dir(),
            check_first: true,
            pack_rotation_bytes: PACK_ROTATION_THRESHOLD,
            max_files_per_request: 32,
            max_concurrent_uploads: 4,
            max_concurrent_lookups: 8,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| BlockServiceError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| BlockServiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override from `BLOCKSERVICE_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("BLOCKSERVICE_UPLOADER_URL") {
            self.uploader_url = url;
        }
        if let Ok(url) = std::env::var("BLOCKSERVICE_PINNING_URL") {
            self.pinning_service_url = url;
        }
        if let Ok(key) = std::env::var("BLOCKSERVICE_API_KEY") {
            self.api_key = key;
        }
        if let Some(flag) = std::env::var("BLOCKSERVICE_DEDICATED_GATEWAY")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.dedicated_gateway = flag;
        }
    }

    /// Endpoints and API key are required before any HTTP client is built
    pub fn validate(&self) -> Result<()> {
        if self.uploader_url.is_empty()
            || self.pinning_service_url.is_empty()
            || self.api_key.is_empty()
        {
            return Err(BlockServiceError::Config(
                "uploader_url, pinning_service_url and api_key must be set".to_string(),
            ));
        }
        if self.max_files_per_request == 0
            || self.max_concurrent_uploads == 0
            || self.max_concurrent_lookups == 0
        {
            return Err(BlockServiceError::Config(
                "request and concurrency limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            check_first: self.check_first,
            dedicated_gateway: self.dedicated_gateway,
            pack_rotation_bytes: self.pack_rotation_bytes,
            max_files_per_request: self.max_files_per_request,
            max_concurrent_uploads: self.max_concurrent_uploads,
            max_concurrent_lookups: self.max_concurrent_lookups,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get placement index database path
    pub fn index_path(&self) -> PathBuf {
        self.storage_dir.join("placements.sled")
    }

    /// Get block cache directory
    pub fn blocks_dir(&self) -> PathBuf {
        self.storage_dir.join("cache")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
