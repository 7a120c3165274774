//! Engine configuration: serde model, file persistence, legacy migration.
//!
//! The config file lives at `~/.easy-file-management/config.json`. When it
//! is missing but the legacy sibling `settings.json` exists, the legacy file
//! is read, rewritten at the new location and deleted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::connection::{ConnectionConfig, KeepAliveConfig, ReconnectConfig};
use crate::error::{EngineError, Result};
use crate::protocol::compress::{Algorithm, CompressionConfig};
use crate::transfer::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

pub const CONFIG_DIR: &str = ".easy-file-management";
pub const CONFIG_FILE: &str = "config.json";
pub const LEGACY_CONFIG_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
    pub security: SecurityConfig,
    pub client: ClientSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            transport: TransportConfig::default(),
            transfer: TransferConfig::default(),
            security: SecurityConfig::default(),
            client: ClientSection::default(),
        }
    }
}

/// Last-known user-facing state the host persists between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// "tcp" for the framed protocol, "ftp" for the alternative transport.
    pub preferred_protocol: String,
    /// Opaque locator into the host's credential store; never the secret
    /// itself.
    pub credentials_ref: Option<String>,
    pub recent_paths: Vec<String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        ClientSection {
            preferred_protocol: "tcp".to_owned(),
            credentials_ref: None,
            recent_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u32,
    /// Only "protobuf" is produced; the field exists so a config file can be
    /// validated rather than silently reinterpreted.
    pub preferred_encoding: String,
    pub compression: CompressionSection,
    pub keepalive: KeepaliveSection,
    pub reconnect: ReconnectSection,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "127.0.0.1".to_owned(),
            port: 9521,
            timeout_ms: 30_000,
            preferred_encoding: "protobuf".to_owned(),
            compression: CompressionSection::default(),
            keepalive: KeepaliveSection::default(),
            reconnect: ReconnectSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    pub enabled: bool,
    pub algorithm: Algorithm,
    pub min_bytes: u32,
}

impl Default for CompressionSection {
    fn default() -> Self {
        CompressionSection {
            enabled: true,
            algorithm: Algorithm::Auto,
            min_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSection {
    pub ping_interval_ms: u32,
    pub ping_timeout_ms: u32,
    pub max_failures: u32,
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        KeepaliveSection {
            ping_interval_ms: 45_000,
            ping_timeout_ms: 10_000,
            max_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u32,
    pub max_delay_ms: u32,
    pub backoff_factor: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        ReconnectSection {
            enabled: false,
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk: ChunkSection,
    pub concurrency: ConcurrencySection,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk: ChunkSection::default(),
            concurrency: ConcurrencySection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSection {
    pub min_bytes: u32,
    pub max_bytes: u32,
    pub default_bytes: u32,
    pub auto_adjust: bool,
}

impl Default for ChunkSection {
    fn default() -> Self {
        ChunkSection {
            min_bytes: MIN_CHUNK_SIZE,
            max_bytes: MAX_CHUNK_SIZE,
            default_bytes: 256 * 1024,
            auto_adjust: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    pub max: u32,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        ConcurrencySection { max: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub host_allowlist: Vec<String>,
    pub allowed_schemes: Vec<String>,
    pub sensitive_header_names: Vec<String>,
    pub request_timeout_ms: Option<u32>,
}

impl EngineConfig {
    /// Sanity-check the whole tree; returns the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.transport.preferred_encoding != "protobuf" {
            return Err(EngineError::config(format!(
                "unsupported preferred_encoding {:?}",
                self.transport.preferred_encoding
            )));
        }
        if self.transport.host.is_empty() {
            return Err(EngineError::config("transport.host is empty"));
        }
        let chunk = &self.transfer.chunk;
        if chunk.min_bytes < MIN_CHUNK_SIZE {
            return Err(EngineError::config(format!(
                "transfer.chunk.min_bytes {} below engine minimum {MIN_CHUNK_SIZE}",
                chunk.min_bytes
            )));
        }
        if chunk.max_bytes > MAX_CHUNK_SIZE {
            return Err(EngineError::config(format!(
                "transfer.chunk.max_bytes {} above frame budget {MAX_CHUNK_SIZE}",
                chunk.max_bytes
            )));
        }
        if chunk.min_bytes > chunk.max_bytes
            || chunk.default_bytes < chunk.min_bytes
            || chunk.default_bytes > chunk.max_bytes
        {
            return Err(EngineError::config(
                "transfer.chunk bounds must satisfy min <= default <= max",
            ));
        }
        let concurrency = self.transfer.concurrency.max;
        if !(1..=8).contains(&concurrency) {
            return Err(EngineError::config(format!(
                "transfer.concurrency.max {concurrency} outside 1..8"
            )));
        }
        for scheme in &self.security.allowed_schemes {
            // A scheme must at least parse as the scheme of some URL.
            if Url::parse(&format!("{scheme}://example")).is_err() {
                return Err(EngineError::config(format!(
                    "security.allowed_schemes entry {scheme:?} is not a valid scheme"
                )));
            }
        }
        if self.transport.reconnect.backoff_factor < 1.0 {
            return Err(EngineError::config(
                "transport.reconnect.backoff_factor must be >= 1.0",
            ));
        }
        if !matches!(self.client.preferred_protocol.as_str(), "tcp" | "ftp") {
            return Err(EngineError::config(format!(
                "unknown client.preferred_protocol {:?}",
                self.client.preferred_protocol
            )));
        }
        Ok(())
    }

    /// Whether a host passes the allowlist (an empty list allows all).
    pub fn host_allowed(&self, host: &str) -> bool {
        self.security.host_allowlist.is_empty()
            || self
                .security
                .host_allowlist
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.transport.host.clone(),
            port: self.transport.port,
            connect_timeout: Duration::from_millis(self.transport.timeout_ms as u64),
            request_timeout: Duration::from_millis(
                self.security
                    .request_timeout_ms
                    .unwrap_or(self.transport.timeout_ms) as u64,
            ),
            keepalive: KeepAliveConfig {
                ping_interval: Duration::from_millis(
                    self.transport.keepalive.ping_interval_ms as u64,
                ),
                ping_timeout: Duration::from_millis(self.transport.keepalive.ping_timeout_ms as u64),
                max_failures: self.transport.keepalive.max_failures,
            },
            reconnect: ReconnectConfig {
                enabled: self.transport.reconnect.enabled,
                max_attempts: self.transport.reconnect.max_attempts,
                initial_delay: Duration::from_millis(
                    self.transport.reconnect.initial_delay_ms as u64,
                ),
                max_delay: Duration::from_millis(self.transport.reconnect.max_delay_ms as u64),
                backoff_factor: self.transport.reconnect.backoff_factor,
            },
            ..ConnectionConfig::default()
        }
    }

    pub fn compression_config(&self) -> CompressionConfig {
        CompressionConfig {
            enabled: self.transport.compression.enabled,
            algorithm: self.transport.compression.algorithm,
            min_bytes: self.transport.compression.min_bytes as usize,
        }
    }

    /// Default on-disk location.
    pub fn default_path() -> PathBuf {
        config_dir().join(CONFIG_FILE)
    }

    /// Load from the default location, migrating the legacy sibling when
    /// needed. A missing file yields defaults.
    pub async fn load() -> Result<Self> {
        Self::load_from(&config_dir()).await
    }

    pub async fn load_from(dir: &Path) -> Result<Self> {
        let current = dir.join(CONFIG_FILE);
        let legacy = dir.join(LEGACY_CONFIG_FILE);

        if !tokio::fs::try_exists(&current).await.unwrap_or(false) {
            if tokio::fs::try_exists(&legacy).await.unwrap_or(false) {
                info!(
                    target: "config",
                    from = %legacy.display(),
                    to = %current.display(),
                    "Migrating legacy configuration"
                );
                let config = Self::read_file(&legacy).await?;
                config.save_to(dir).await?;
                if let Err(err) = tokio::fs::remove_file(&legacy).await {
                    warn!(
                        target: "config",
                        error = %err,
                        "Could not delete legacy configuration file"
                    );
                }
                return Ok(config);
            }
            return Ok(EngineConfig::default());
        }
        Self::read_file(&current).await
    }

    pub async fn save(&self) -> Result<()> {
        self.save_to(&config_dir()).await
    }

    pub async fn save_to(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(CONFIG_FILE);
        let serialized = serde_json::to_vec_pretty(self)
            .map_err(|err| EngineError::config(format!("config serialize: {err}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let config: EngineConfig = serde_json::from_slice(&raw)
            .map_err(|err| EngineError::config(format!("config parse: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_encoding_is_rejected() {
        let mut config = EngineConfig::default();
        config.transport.preferred_encoding = "json".to_owned();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn chunk_bounds_are_checked() {
        let mut config = EngineConfig::default();
        config.transfer.chunk.default_bytes = config.transfer.chunk.max_bytes + 1024;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.transfer.chunk.min_bytes = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn concurrency_range_is_checked() {
        let mut config = EngineConfig::default();
        config.transfer.concurrency.max = 0;
        assert!(config.validate().is_err());
        config.transfer.concurrency.max = 9;
        assert!(config.validate().is_err());
        config.transfer.concurrency.max = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn host_allowlist_matching() {
        let mut config = EngineConfig::default();
        assert!(config.host_allowed("anything.example"));
        config.security.host_allowlist = vec!["files.example".to_owned()];
        assert!(config.host_allowed("FILES.example"));
        assert!(!config.host_allowed("evil.example"));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.transport.host = "files.internal".to_owned();
        config.transport.port = 7777;
        config.save_to(dir.path()).await.unwrap();

        let loaded = EngineConfig::load_from(dir.path()).await.unwrap();
        assert_eq!(loaded.transport.host, "files.internal");
        assert_eq!(loaded.transport.port, 7777);
    }

    #[tokio::test]
    async fn legacy_file_is_migrated_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut legacy = EngineConfig::default();
        legacy.transport.port = 4242;
        let raw = serde_json::to_vec(&legacy).unwrap();
        tokio::fs::write(dir.path().join(LEGACY_CONFIG_FILE), raw)
            .await
            .unwrap();

        let loaded = EngineConfig::load_from(dir.path()).await.unwrap();
        assert_eq!(loaded.transport.port, 4242);
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert!(!dir.path().join(LEGACY_CONFIG_FILE).exists());
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = EngineConfig::load_from(dir.path()).await.unwrap();
        assert_eq!(loaded.transport.port, EngineConfig::default().transport.port);
    }
}
