//! # Configuration Modules
//!
//! Layered configuration for the ranked-list server: defaults, JSON file,
//! environment and command line.

/// Provides the layered server configuration.
pub mod config_rank;

pub use config_rank::{load_config, Config, ConfigArgs, ConfigEcho, ConfigError, PromotionMode};
