//! Configuration file management.
//!
//! `config.toml` lives in the provider home (`$KENNEL_HOME`, else
//! `~/.kennel`). Every section is optional; missing keys take defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the provider home.
pub const HOME_ENV: &str = "KENNEL_HOME";

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub proofs: ProofsConfig,
    #[serde(default)]
    pub strays: StraysConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Provider identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Bech32 account address of this provider.
    #[serde(default)]
    pub address: String,
    /// URL other providers use to reach this one.
    #[serde(default)]
    pub public_url: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Provider home. Empty = `$KENNEL_HOME` or `~/.kennel`.
    #[serde(default)]
    pub home: String,
    /// Merkle block size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest accepted upload in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Delete unreferenced files at startup.
    #[serde(default = "default_true")]
    pub prune_on_start: bool,
}

/// Proof loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofsConfig {
    /// Seconds between proof cycles.
    #[serde(default = "default_proof_interval")]
    pub interval: u64,
    /// Consecutive misses tolerated before eviction.
    #[serde(default = "default_max_misses")]
    pub max_misses: u32,
}

/// Stray claimer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StraysConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between stray listings.
    #[serde(default = "default_stray_interval")]
    pub interval: u64,
    /// Concurrent claims.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

/// Transaction queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between flushes.
    #[serde(default = "default_queue_interval")]
    pub interval: u64,
    /// Byte cap of one batch.
    #[serde(default = "default_message_size")]
    pub message_size: usize,
    /// Memo attached to every transaction.
    #[serde(default = "default_memo")]
    pub memo: String,
}

/// Chain gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Timeout for chain and peer requests.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    kennel_types::DEFAULT_BLOCK_SIZE
}

fn default_max_file_size() -> u64 {
    kennel_types::DEFAULT_MAX_FILE_SIZE
}

fn default_proof_interval() -> u64 {
    kennel_types::DEFAULT_PROOF_INTERVAL_SECS
}

fn default_max_misses() -> u32 {
    kennel_types::DEFAULT_MAX_MISSES
}

fn default_stray_interval() -> u64 {
    kennel_types::DEFAULT_STRAY_INTERVAL_SECS
}

fn default_threads() -> usize {
    kennel_types::DEFAULT_STRAY_THREADS
}

fn default_queue_interval() -> u64 {
    kennel_types::DEFAULT_QUEUE_INTERVAL_SECS
}

fn default_message_size() -> usize {
    kennel_types::DEFAULT_MESSAGE_SIZE
}

fn default_memo() -> String {
    format!("kennel v{}", env!("CARGO_PKG_VERSION"))
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:1317".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_port() -> u16 {
    kennel_types::DEFAULT_HTTP_PORT
}

fn default_log_level() -> String {
    "kennel=info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            home: String::new(),
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            prune_on_start: true,
        }
    }
}

impl Default for ProofsConfig {
    fn default() -> Self {
        Self {
            interval: default_proof_interval(),
            max_misses: default_max_misses(),
        }
    }
}

impl Default for StraysConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_stray_interval(),
            threads: default_threads(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            interval: default_queue_interval(),
            message_size: default_message_size(),
            memo: default_memo(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load `config.toml` from the default home.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let home = Self::default_home();
        let mut config = Self::load_from(&home.join("config.toml"))?;
        if config.storage.home.is_empty() {
            config.storage.home = home.to_string_lossy().into_owned();
        }
        Ok(config)
    }

    /// Load a specific config file, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Provider home holding `storage/`, `data/` and `config.toml`.
    pub fn home(&self) -> PathBuf {
        if self.storage.home.is_empty() {
            Self::default_home()
        } else {
            PathBuf::from(&self.storage.home)
        }
    }

    /// Directory of the contract index database.
    pub fn data_dir(&self) -> PathBuf {
        self.home().join("data")
    }

    pub fn proof_interval(&self) -> Duration {
        Duration::from_secs(self.proofs.interval)
    }

    pub fn stray_interval(&self) -> Duration {
        Duration::from_secs(self.strays.interval)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue.interval)
    }

    pub fn chain_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.timeout_secs)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.provider.address.is_empty() {
            anyhow::bail!("provider.address must be set");
        }
        if self.storage.chunk_size == 0 {
            anyhow::bail!("storage.chunk_size must be positive");
        }
        if self.strays.threads == 0 && self.strays.enabled {
            anyhow::bail!("strays.threads must be positive when strays are enabled");
        }
        if self.queue.message_size == 0 {
            anyhow::bail!("queue.message_size must be positive");
        }
        Ok(())
    }

    fn default_home() -> PathBuf {
        if let Ok(dir) = std::env::var(HOME_ENV) {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".kennel"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/kennel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.storage.chunk_size, 10_240);
        assert_eq!(config.storage.max_file_size, 32 * 1024 * 1024 * 1024);
        assert_eq!(config.proofs.interval, 32);
        assert_eq!(config.proofs.max_misses, 16);
        assert_eq!(config.strays.threads, 3);
        assert_eq!(config.strays.interval, 20);
        assert_eq!(config.queue.message_size, 500_000);
        assert_eq!(config.queue.interval, 4);
        assert_eq!(config.http.port, 3333);
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let _parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[provider]\naddress = \"jkl1me\"\n\n[proofs]\nmax_misses = 4\n",
        )
        .expect("write");

        let config = DaemonConfig::load_from(&path).expect("load");
        assert_eq!(config.provider.address, "jkl1me");
        assert_eq!(config.proofs.max_misses, 4);
        assert_eq!(config.proofs.interval, 32);
        assert_eq!(config.http.port, 3333);
        config.validate().expect("valid");
    }

    #[test]
    fn test_missing_file_is_default_and_invalid() {
        let config = DaemonConfig::load_from(Path::new("/nonexistent/kennel.toml")).expect("load");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_home_layout() {
        let mut config = DaemonConfig::default();
        config.storage.home = "/srv/kennel".into();
        assert_eq!(config.data_dir(), PathBuf::from("/srv/kennel/data"));
    }
}
