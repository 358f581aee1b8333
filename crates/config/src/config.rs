//! Main configuration module for Fin Core.
//!
//! All node settings live in one `fincore.toml` file; every section has
//! serde defaults so a minimal file configures a working node.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration struct containing all Fin Core settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chain identity
    #[serde(default)]
    pub chain: ChainConfig,

    /// Consensus and vote-processing knobs
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Partitioned block log layout
    #[serde(default)]
    pub blocklog: BlockLogConfigSection,

    /// State-history service
    #[serde(default)]
    pub history: HistoryConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content)?;
        debug!("configuration parsed, validating");
        config.validate()?;
        info!(chain = %config.chain.chain_name, "configuration loaded");
        Ok(config)
    }

    /// Load configuration from a TOML string (tests and embedded configs).
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all values are within acceptable ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chain.chain_name.is_empty() {
            return Err(ConfigError::Invalid("chain_name must not be empty".into()));
        }
        if self.consensus.max_votes_per_connection == 0 {
            return Err(ConfigError::Invalid(
                "max_votes_per_connection must be positive".into(),
            ));
        }
        if self.blocklog.stride == 0 {
            return Err(ConfigError::Invalid("blocklog stride must be positive".into()));
        }
        if self.history.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "history read_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Chain identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Human-readable chain name; appears in logs only
    pub chain_name: String,
    /// Chain id, mixed into nothing by the core but exported to tooling
    pub chain_id: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_name: "fincore-dev".to_string(),
            chain_id: 1,
        }
    }
}

/// Consensus-layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Per-connection accepted-vote allowance
    pub max_votes_per_connection: u32,
    /// Blocks past the head for which unlinkable blocks are buffered
    pub unlinkable_lookahead: u32,
    /// Path of the finalizer safety file
    pub safety_file: PathBuf,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_votes_per_connection: 2500,
            unlinkable_lookahead: 16,
            safety_file: PathBuf::from("./data/safety.dat"),
        }
    }
}

/// Partitioned block log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLogConfigSection {
    /// Directory holding the head chunk
    pub dir: PathBuf,
    /// Blocks per sealed chunk
    pub stride: u32,
    /// Where sealed chunks stay readable; defaults to `dir`
    pub retained_dir: Option<PathBuf>,
    /// Where evicted chunks go; unset means delete
    pub archive_dir: Option<PathBuf>,
    /// Sealed chunks kept readable; 0 means unlimited
    pub max_retained_files: u32,
}

impl Default for BlockLogConfigSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/blocks"),
            stride: 65536,
            retained_dir: None,
            archive_dir: None,
            max_retained_files: 0,
        }
    }
}

/// State-history service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Whether the service runs at all
    pub enabled: bool,
    /// TCP listen address
    pub listen: String,
    /// Optional local socket path
    pub local_socket: Option<PathBuf>,
    /// Directory for the per-kind payload logs
    pub log_dir: PathBuf,
    pub trace_history: bool,
    pub chain_state_history: bool,
    pub finality_data_history: bool,
    /// Seconds of client silence before a session closes
    pub read_timeout_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:8080".to_string(),
            local_socket: None,
            log_dir: PathBuf::from("./data/history"),
            trace_history: true,
            chain_state_history: true,
            finality_data_history: false,
            read_timeout_secs: 60,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn`, or `error`
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
