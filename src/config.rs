//! Server configuration, loaded from TOML with CLI overrides on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level server config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the TCP listener.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Maximum heartbeat silence before a client is deregistered.
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    /// Tile budget per display page.
    #[serde(default = "default_max_tiles")]
    pub max_tiles: usize,
    /// Per-client raw frame buffer capacity.
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// Per-client decoded image buffer capacity.
    #[serde(default = "default_image_queue_capacity")]
    pub image_queue_capacity: usize,
}

fn default_bind() -> SocketAddr {
    "127.0.0.1:7460".parse().expect("static address")
}

fn default_liveness_timeout_ms() -> u64 {
    crate::session::LIVENESS_TIMEOUT_MS
}

fn default_max_tiles() -> usize {
    crate::viewport::MAX_TILES
}

fn default_frame_queue_capacity() -> usize {
    crate::session::DEFAULT_FRAME_QUEUE_CAPACITY
}

fn default_image_queue_capacity() -> usize {
    crate::session::DEFAULT_IMAGE_QUEUE_CAPACITY
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            max_tiles: default_max_tiles(),
            frame_queue_capacity: default_frame_queue_capacity(),
            image_queue_capacity: default_image_queue_capacity(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file path. Returns `None` if the file does
    /// not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write config {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(toml::ser::Error),
}
