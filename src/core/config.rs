//! Transfer configuration
//!
//! All knobs of the pipeline live in [`TransferConfig`]. Defaults match the
//! behaviour users expect from a chat-driven uploader: 1 MiB download chunks,
//! 10 MiB upload chunks, five retries one second apart and one status update
//! per second at most.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::{Error, Result};

/// Default chunk size for HTTP downloads
pub const DEFAULT_DOWNLOAD_CHUNK: usize = 1024 * 1024;

/// Default chunk size for resumable uploads
pub const DEFAULT_UPLOAD_CHUNK: usize = 10 * 1024 * 1024;

/// Configuration shared by the resolver, the transfer engine and the queue
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory holding `.part` artifacts and finished downloads
    pub download_dir: PathBuf,

    /// User-Agent sent on every request, redirects included
    pub user_agent: String,

    /// Block size used when writing downloaded bytes
    pub download_chunk_size: usize,

    /// Block size sent per upload request
    pub upload_chunk_size: usize,

    /// Retry budget for transient faults, refilled by every written chunk
    pub max_retries: u32,

    /// Fixed pause between two attempts
    pub retry_delay_ms: u64,

    /// Maximum number of landing-page hops
    pub hop_limit: usize,

    /// Minimum time between two forwarded progress samples
    pub progress_interval_ms: u64,

    /// TCP connect timeout
    pub connect_timeout_ms: u64,

    /// Maximum silence while waiting for headers or the next body chunk
    pub read_timeout_ms: u64,

    /// Attempts made to edit a status message before posting a new one
    pub status_max_tries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./data/downloads"),
            user_agent: format!("Mozilla/5.0 (compatible; linkferry/{})", env!("LINKFERRY_VERSION")),
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK,
            max_retries: 5,
            retry_delay_ms: 1000,
            hop_limit: 5,
            progress_interval_ms: 1000,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            status_max_tries: 4,
        }
    }
}

impl TransferConfig {
    /// Load a configuration from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            Error::InvalidInput(format!("config file {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the engine
    pub fn validate(&self) -> Result<()> {
        if self.download_chunk_size == 0 || self.upload_chunk_size == 0 {
            return Err(Error::InvalidInput("chunk sizes must be positive".to_string()));
        }
        if self.read_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::InvalidInput("timeouts must be positive".to_string()));
        }
        if self.status_max_tries == 0 {
            return Err(Error::InvalidInput("status_max_tries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
