//! # Ranked-List Server Configuration
//!
//! Settings are layered the same way for every server binary in this workspace:
//!
//! 1. Built-in defaults.
//! 2. An optional JSON file (`server_rank.conf` unless `--config-path` says otherwise).
//! 3. Environment variables (`RANK_*`) and command-line flags, handled by `clap`.
//!
//! Every layer is a [`ConfigArgs`] where each field is optional; a later layer
//! overrides an earlier one field by field. [`ConfigArgs::resolve`] then turns the
//! merged layers into a fully populated [`Config`].

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "server_rank.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fileFormat {0:?} must contain a run of 'N' placeholders")]
    MissingPlaceholder(String),

    #[error("{name} must be at least 1, got {value}")]
    TooSmall { name: &'static str, value: u64 },
}

/// How accepted votes turn into promotion steps.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromotionMode {
    /// One step each time the item's vote count reaches a multiple of `voteThreshold`.
    #[default]
    Threshold,
    /// One step for every accepted vote.
    Immediate,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Collaborative ranked-list WebSocket server", version)]
#[serde(rename_all = "camelCase")]
pub struct ConfigArgs {
    #[clap(long, env = "RANK_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RANK_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RANK_ORIGIN", help = "Required Origin header value; unset accepts any origin.")]
    pub origin: Option<String>,

    #[clap(long, env = "RANK_TITLE", help = "Display title echoed to clients.")]
    pub title: Option<String>,

    #[clap(long, env = "RANK_MAX_CONNS_PER_IP", help = "Concurrent connections allowed per address.")]
    pub max_conns_per_ip: Option<u32>,

    #[clap(long, env = "RANK_PRUNE_INTERVAL_SECS", help = "Seconds between keepalive pings.")]
    pub prune_interval_secs: Option<u64>,

    #[clap(long, env = "RANK_SAVE_INTERVAL_SECS", help = "Seconds between debounced saves.")]
    pub save_interval_secs: Option<u64>,

    #[clap(long, env = "RANK_MAX_ITEMS", help = "Item count that triggers archival rollover.")]
    pub max_items: Option<usize>,

    #[clap(long, env = "RANK_MAX_TEXT_LEN", help = "Maximum item text length in characters.")]
    pub max_text_len: Option<usize>,

    #[clap(long, env = "RANK_MAX_CHAT_LINES", help = "Chat lines kept in the discussion log.")]
    pub max_chat_lines: Option<usize>,

    #[clap(long, env = "RANK_MAX_CHAT_LEN", help = "Maximum chat line length in characters.")]
    pub max_chat_len: Option<usize>,

    #[clap(long, env = "RANK_FILENAME", help = "Live list document path.")]
    pub filename: Option<PathBuf>,

    #[clap(long, env = "RANK_FILE_FORMAT", help = "Archive name pattern, e.g. data/storyNNN.json.")]
    pub file_format: Option<String>,

    #[clap(long, env = "RANK_CHAT_FILENAME", help = "Discussion log document path.")]
    pub chat_filename: Option<PathBuf>,

    #[clap(long, env = "RANK_VOTE_THRESHOLD", help = "Votes needed per promotion step.")]
    pub vote_threshold: Option<u32>,

    #[clap(long, value_enum, env = "RANK_PROMOTION_MODE", help = "threshold or immediate.")]
    pub promotion_mode: Option<PromotionMode>,

    #[clap(long, env = "RANK_VOTE_COOLDOWN_MS", help = "Minimum milliseconds between votes of one connection.")]
    pub vote_cooldown_ms: Option<u64>,

    #[clap(long, env = "RANK_IDLE_BASE_SECS", help = "Idle grace per vote before a participant is kicked.")]
    pub idle_base_secs: Option<u64>,

    #[clap(long, env = "RANK_ANTI_ABUSE", help = "Enable edit-size and quick-reconnect heuristics.")]
    pub anti_abuse: Option<bool>,

    #[clap(long, env = "RANK_MAX_EDIT_DELTA", help = "Largest allowed change in text length per edit.")]
    pub max_edit_delta: Option<usize>,

    #[clap(long, env = "RANK_QUICK_DISCONNECT_MS", help = "Connections shorter than this count as quick disconnects.")]
    pub quick_disconnect_ms: Option<u64>,

    #[clap(long, env = "RANK_ABUSE_BAN_THRESHOLD", help = "Strikes per heuristic before an address is banned.")]
    pub abuse_ban_threshold: Option<u32>,

    #[clap(long, env = "RANK_ENABLE_SUDO", help = "Accept privileged sub-commands.")]
    pub enable_sudo: Option<bool>,

    #[clap(long, env = "RANK_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RANK_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl ConfigArgs {
    /// Built-in defaults, matching the production deployment.
    pub fn defaults() -> Self {
        Self {
            config_path: None,
            port: Some(4000),
            origin: None,
            title: Some("edit-fight".to_string()),
            max_conns_per_ip: Some(3),
            prune_interval_secs: Some(30),
            save_interval_secs: Some(10),
            max_items: Some(250),
            max_text_len: Some(16),
            max_chat_lines: Some(100),
            max_chat_len: Some(256),
            filename: Some(PathBuf::from("data/story.json")),
            file_format: Some("data/storyNNN.json".to_string()),
            chat_filename: Some(PathBuf::from("data/chat.json")),
            vote_threshold: Some(3),
            promotion_mode: Some(PromotionMode::Threshold),
            vote_cooldown_ms: Some(2000),
            idle_base_secs: Some(60),
            anti_abuse: Some(true),
            max_edit_delta: Some(8),
            quick_disconnect_ms: Some(1500),
            abuse_ban_threshold: Some(5),
            enable_sudo: Some(true),
            log_dir: Some(PathBuf::from("logs")),
            log_level: Some("info".to_string()),
        }
    }

    // Merge two layers, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: ConfigArgs) -> ConfigArgs {
        ConfigArgs {
            config_path: other.config_path.or(self.config_path),
            port: other.port.or(self.port),
            origin: other.origin.or(self.origin),
            title: other.title.or(self.title),
            max_conns_per_ip: other.max_conns_per_ip.or(self.max_conns_per_ip),
            prune_interval_secs: other.prune_interval_secs.or(self.prune_interval_secs),
            save_interval_secs: other.save_interval_secs.or(self.save_interval_secs),
            max_items: other.max_items.or(self.max_items),
            max_text_len: other.max_text_len.or(self.max_text_len),
            max_chat_lines: other.max_chat_lines.or(self.max_chat_lines),
            max_chat_len: other.max_chat_len.or(self.max_chat_len),
            filename: other.filename.or(self.filename),
            file_format: other.file_format.or(self.file_format),
            chat_filename: other.chat_filename.or(self.chat_filename),
            vote_threshold: other.vote_threshold.or(self.vote_threshold),
            promotion_mode: other.promotion_mode.or(self.promotion_mode),
            vote_cooldown_ms: other.vote_cooldown_ms.or(self.vote_cooldown_ms),
            idle_base_secs: other.idle_base_secs.or(self.idle_base_secs),
            anti_abuse: other.anti_abuse.or(self.anti_abuse),
            max_edit_delta: other.max_edit_delta.or(self.max_edit_delta),
            quick_disconnect_ms: other.quick_disconnect_ms.or(self.quick_disconnect_ms),
            abuse_ban_threshold: other.abuse_ban_threshold.or(self.abuse_ban_threshold),
            enable_sudo: other.enable_sudo.or(self.enable_sudo),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    /// Fills every unset field from [`ConfigArgs::defaults`] and validates the result.
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let c = ConfigArgs::defaults().merge(self);

        let config = Config {
            port: c.port.unwrap_or(4000),
            origin: c.origin.filter(|o| !o.is_empty()),
            title: c.title.unwrap_or_default(),
            max_conns_per_ip: c.max_conns_per_ip.unwrap_or(3),
            prune_interval: Duration::from_secs(c.prune_interval_secs.unwrap_or(30)),
            save_interval: Duration::from_secs(c.save_interval_secs.unwrap_or(10)),
            max_items: c.max_items.unwrap_or(250),
            max_text_len: c.max_text_len.unwrap_or(16),
            max_chat_lines: c.max_chat_lines.unwrap_or(100),
            max_chat_len: c.max_chat_len.unwrap_or(256),
            filename: c.filename.unwrap_or_else(|| PathBuf::from("data/story.json")),
            file_format: c.file_format.unwrap_or_else(|| "data/storyNNN.json".to_string()),
            chat_filename: c.chat_filename.unwrap_or_else(|| PathBuf::from("data/chat.json")),
            vote_threshold: c.vote_threshold.unwrap_or(3),
            promotion_mode: c.promotion_mode.unwrap_or_default(),
            vote_cooldown: Duration::from_millis(c.vote_cooldown_ms.unwrap_or(2000)),
            idle_base: Duration::from_secs(c.idle_base_secs.unwrap_or(60)),
            anti_abuse: c.anti_abuse.unwrap_or(true),
            max_edit_delta: c.max_edit_delta.unwrap_or(8),
            quick_disconnect: Duration::from_millis(c.quick_disconnect_ms.unwrap_or(1500)),
            abuse_ban_threshold: c.abuse_ban_threshold.unwrap_or(5),
            enable_sudo: c.enable_sudo.unwrap_or(true),
            log_dir: c.log_dir.unwrap_or_else(|| PathBuf::from("logs")),
            log_level: c.log_level.unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Fully resolved settings shared by the hub, the gateway and the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub origin: Option<String>,
    pub title: String,
    pub max_conns_per_ip: u32,
    pub prune_interval: Duration,
    pub save_interval: Duration,
    pub max_items: usize,
    pub max_text_len: usize,
    pub max_chat_lines: usize,
    pub max_chat_len: usize,
    pub filename: PathBuf,
    pub file_format: String,
    pub chat_filename: PathBuf,
    pub vote_threshold: u32,
    pub promotion_mode: PromotionMode,
    pub vote_cooldown: Duration,
    pub idle_base: Duration,
    pub anti_abuse: bool,
    pub max_edit_delta: usize,
    pub quick_disconnect: Duration,
    pub abuse_ban_threshold: u32,
    pub enable_sudo: bool,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults always validate.
        match ConfigArgs::default().resolve() {
            Ok(config) => config,
            Err(e) => unreachable!("built-in defaults are invalid: {e}"),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.file_format.contains('N') {
            return Err(ConfigError::MissingPlaceholder(self.file_format.clone()));
        }
        let at_least_one = [
            ("maxConnsPerIp", self.max_conns_per_ip as u64),
            ("maxItems", self.max_items as u64),
            ("voteThreshold", self.vote_threshold as u64),
            ("pruneIntervalSecs", self.prune_interval.as_secs()),
            ("saveIntervalSecs", self.save_interval.as_secs()),
        ];
        for (name, value) in at_least_one {
            if value == 0 {
                return Err(ConfigError::TooSmall { name, value });
            }
        }
        Ok(())
    }

    /// The part of the configuration clients see in their `initial` payload.
    pub fn echo(&self) -> ConfigEcho {
        ConfigEcho {
            title: self.title.clone(),
            max_text_len: self.max_text_len,
            max_chat_lines: self.max_chat_lines,
            vote_threshold: self.vote_threshold,
            vote_cooldown_ms: self.vote_cooldown.as_millis() as u64,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEcho {
    pub title: String,
    pub max_text_len: usize,
    pub max_chat_lines: usize,
    pub vote_threshold: u32,
    pub vote_cooldown_ms: u64,
}

/// Reads one JSON layer from disk. Failures are logged and yield `None`.
pub fn read_config_file(path: &PathBuf) -> Option<ConfigArgs> {
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<ConfigArgs>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                tracing::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and `cli` (which already carries env vars).
pub fn layer_config(cli: ConfigArgs) -> Result<Config, ConfigError> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = ConfigArgs::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli).resolve()
}

/// Parses the process arguments/environment and layers them over the file and defaults.
pub fn load_config() -> Result<Config, ConfigError> {
    layer_config(ConfigArgs::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_resolve() {
        let config = Config::default();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_conns_per_ip, 3);
        assert_eq!(config.max_items, 250);
        assert_eq!(config.file_format, "data/storyNNN.json");
        assert_eq!(config.promotion_mode, PromotionMode::Threshold);
        assert!(config.origin.is_none());
    }

    #[test]
    fn file_layer_is_overridden_by_cli_layer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 5000, "maxItems": 10, "promotionMode": "immediate"}}"#).unwrap();

        let cli = ConfigArgs {
            config_path: Some(file.path().to_path_buf()),
            port: Some(6000),
            ..Default::default()
        };
        let config = layer_config(cli).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.max_items, 10);
        assert_eq!(config.promotion_mode, PromotionMode::Immediate);
        assert_eq!(config.max_text_len, 16);
    }

    #[test]
    fn unparsable_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let cli = ConfigArgs {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(layer_config(cli).unwrap().port, 4000);
    }

    #[test]
    fn rejects_pattern_without_placeholder() {
        let args = ConfigArgs {
            file_format: Some("data/story.json".to_string()),
            ..Default::default()
        };
        assert!(matches!(args.resolve(), Err(ConfigError::MissingPlaceholder(_))));
    }

    #[test]
    fn rejects_zero_cap() {
        let args = ConfigArgs {
            max_conns_per_ip: Some(0),
            ..Default::default()
        };
        assert!(matches!(args.resolve(), Err(ConfigError::TooSmall { name: "maxConnsPerIp", .. })));
    }

    #[test]
    fn empty_origin_means_any() {
        let args = ConfigArgs {
            origin: Some(String::new()),
            ..Default::default()
        };
        assert!(args.resolve().unwrap().origin.is_none());
    }
}
