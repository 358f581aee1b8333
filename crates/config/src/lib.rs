//! # Fin Core Config
//!
//! Single-file TOML configuration for Fin Core nodes: chain identity,
//! consensus knobs, block log layout, the state-history service, and
//! logging, all in one `fincore.toml` with validated defaults.

pub mod config;
pub mod error;

pub use config::{
    BlockLogConfigSection, ChainConfig, Config, ConsensusConfig, HistoryConfig, LoggingConfig,
};
pub use error::{ConfigError, ConfigResult};
