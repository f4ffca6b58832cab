//! Configuration management for the inferwatch indexer.
//!
//! This module handles loading configuration from:
//! - TOML files
//! - Environment variable placeholders (`${VAR}`) inside the file
//! - Default values (fallbacks for absent keys only)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the indexer and API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream chain API
    pub upstream: UpstreamConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Per-kind polling schedules
    #[serde(default)]
    pub polling: PollingConfig,

    /// Proactive warm settings
    #[serde(default)]
    pub warm: WarmConfig,

    /// Reward windows
    #[serde(default)]
    pub rewards: RewardsConfig,

    /// HTTP API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream chain API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URLs, tried in rotation
    pub base_urls: Vec<String>,

    /// Timeout for point lookups
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for paginated bulk pages
    #[serde(default = "default_bulk_timeout_secs")]
    pub bulk_timeout_secs: u64,

    /// Timeout for inference endpoint health probes
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Identity lookup service
    #[serde(default = "default_keybase_url")]
    pub keybase_url: String,

    /// Records requested per inference page
    #[serde(default = "default_inference_page_size")]
    pub inference_page_size: u32,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://inferwatch.db")
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Data kinds polled on their own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    /// Current epoch snapshots and aggregates
    CurrentEpoch,
    /// Validator jail status
    JailStatus,
    /// Inference endpoint health
    NodeHealth,
    /// Participant rewards
    Rewards,
    /// Warm keys
    WarmKeys,
    /// Hardware nodes
    HardwareNodes,
    /// Epoch reward totals
    RewardTotals,
    /// Bulk inference grouping
    Inferences,
}

impl PollKind {
    /// Every kind.
    pub const ALL: [PollKind; 8] = [
        PollKind::CurrentEpoch,
        PollKind::JailStatus,
        PollKind::NodeHealth,
        PollKind::Rewards,
        PollKind::WarmKeys,
        PollKind::HardwareNodes,
        PollKind::RewardTotals,
        PollKind::Inferences,
    ];

    /// Config key of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurrentEpoch => "current_epoch",
            Self::JailStatus => "jail_status",
            Self::NodeHealth => "node_health",
            Self::Rewards => "rewards",
            Self::WarmKeys => "warm_keys",
            Self::HardwareNodes => "hardware_nodes",
            Self::RewardTotals => "reward_totals",
            Self::Inferences => "inferences",
        }
    }

    fn default_interval_secs(&self) -> u64 {
        match self {
            Self::CurrentEpoch => 30,
            Self::JailStatus => 120,
            Self::NodeHealth => 60,
            Self::Rewards => 60,
            Self::WarmKeys => 300,
            Self::HardwareNodes => 600,
            Self::RewardTotals => 600,
            Self::Inferences => 60,
        }
    }

    // Staggered so the first cycles don't all hit upstream at once.
    fn default_startup_delay_secs(&self) -> u64 {
        match self {
            Self::CurrentEpoch => 0,
            Self::JailStatus => 10,
            Self::NodeHealth => 5,
            Self::Rewards => 15,
            Self::WarmKeys => 20,
            Self::HardwareNodes => 25,
            Self::RewardTotals => 30,
            Self::Inferences => 35,
        }
    }
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polling settings of one kind as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollSettings {
    /// Seconds between cycles
    #[serde(default)]
    pub interval_secs: Option<u64>,

    /// Participants fetched concurrently per batch
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Seconds to wait before the first cycle
    #[serde(default)]
    pub startup_delay_secs: Option<u64>,
}

/// Effective schedule of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Time between cycles
    pub interval: Duration,

    /// Concurrent fetches per batch
    pub batch_size: usize,

    /// Delay before the first cycle
    pub startup_delay: Duration,
}

/// Polling configuration, one table per kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollingConfig {
    /// `[polling.current_epoch]`
    #[serde(default)]
    pub current_epoch: PollSettings,

    /// `[polling.jail_status]`
    #[serde(default)]
    pub jail_status: PollSettings,

    /// `[polling.node_health]`
    #[serde(default)]
    pub node_health: PollSettings,

    /// `[polling.rewards]`
    #[serde(default)]
    pub rewards: PollSettings,

    /// `[polling.warm_keys]`
    #[serde(default)]
    pub warm_keys: PollSettings,

    /// `[polling.hardware_nodes]`
    #[serde(default)]
    pub hardware_nodes: PollSettings,

    /// `[polling.reward_totals]`
    #[serde(default)]
    pub reward_totals: PollSettings,

    /// `[polling.inferences]`
    #[serde(default)]
    pub inferences: PollSettings,
}

impl PollingConfig {
    fn settings(&self, kind: PollKind) -> &PollSettings {
        match kind {
            PollKind::CurrentEpoch => &self.current_epoch,
            PollKind::JailStatus => &self.jail_status,
            PollKind::NodeHealth => &self.node_health,
            PollKind::Rewards => &self.rewards,
            PollKind::WarmKeys => &self.warm_keys,
            PollKind::HardwareNodes => &self.hardware_nodes,
            PollKind::RewardTotals => &self.reward_totals,
            PollKind::Inferences => &self.inferences,
        }
    }

    /// Effective schedule of a kind: supplied values verbatim, defaults only
    /// for absent keys.
    pub fn schedule(&self, kind: PollKind) -> Schedule {
        let settings = self.settings(kind);
        Schedule {
            interval: Duration::from_secs(
                settings
                    .interval_secs
                    .unwrap_or_else(|| kind.default_interval_secs()),
            ),
            batch_size: settings.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            startup_delay: Duration::from_secs(
                settings
                    .startup_delay_secs
                    .unwrap_or_else(|| kind.default_startup_delay_secs()),
            ),
        }
    }
}

/// Proactive warm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmConfig {
    /// Minimum seconds between the end of one warm run and the start of the next
    #[serde(default = "default_warm_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_warm_cooldown_secs(),
        }
    }
}

/// Reward windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    /// Epochs back polled for participant rewards
    #[serde(default = "default_lookback_epochs")]
    pub lookback_epochs: u64,

    /// Epochs back checked by the reward total sweep
    #[serde(default = "default_sweep_epochs")]
    pub sweep_epochs: u64,

    /// Epochs of reward history in a participant detail
    #[serde(default = "default_history_epochs")]
    pub history_epochs: u64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            lookback_epochs: default_lookback_epochs(),
            sweep_epochs: default_sweep_epochs(),
            history_epochs: default_history_epochs(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Age after which the in-memory current epoch is refreshed on read
    #[serde(default = "default_current_epoch_max_age_secs")]
    pub current_epoch_max_age_secs: u64,

    /// Run the pollers inside the API process
    #[serde(default = "default_run_pollers")]
    pub run_pollers: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            current_epoch_max_age_secs: default_current_epoch_max_age_secs(),
            run_pollers: default_run_pollers(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

const DEFAULT_BATCH_SIZE: usize = 10;

// Default value functions
fn default_request_timeout_secs() -> u64 {
    10
}

fn default_bulk_timeout_secs() -> u64 {
    60
}

fn default_health_timeout_secs() -> u64 {
    5
}

fn default_keybase_url() -> String {
    "https://keybase.io".to_string()
}

fn default_inference_page_size() -> u32 {
    1000
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_warm_cooldown_secs() -> u64 {
    60
}

fn default_lookback_epochs() -> u64 {
    6
}

fn default_sweep_epochs() -> u64 {
    5
}

fn default_history_epochs() -> u64 {
    5
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_current_epoch_max_age_secs() -> u64 {
    300
}

fn default_run_pollers() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables can be referenced using `${VAR_NAME}` syntax.
    /// For example: `url = "${INFERWATCH_DATABASE_URL}"`
    ///
    /// # Example
    /// ```no_run
    /// # use inferwatch_indexer::config::Config;
    /// let config = Config::from_file("inferwatch.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        // Expand environment variables before parsing
        let expanded = Self::expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_urls.is_empty() {
            anyhow::bail!("Upstream base_urls cannot be empty");
        }
        for url in &self.upstream.base_urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("Upstream base URL must start with http:// or https:// (got '{}')", url);
            }
        }
        if self.upstream.request_timeout_secs == 0
            || self.upstream.bulk_timeout_secs == 0
            || self.upstream.health_timeout_secs == 0
        {
            anyhow::bail!("Upstream timeouts must be > 0");
        }
        if self.upstream.inference_page_size == 0 {
            anyhow::bail!("Upstream inference_page_size must be > 0");
        }

        // Validate database URL
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        // Validate connection pool settings
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        // tokio::time::interval panics on a zero period
        for kind in PollKind::ALL {
            let schedule = self.polling.schedule(kind);
            if schedule.interval.is_zero() {
                anyhow::bail!("Polling {} interval_secs must be > 0", kind);
            }
            if schedule.batch_size == 0 {
                anyhow::bail!("Polling {} batch_size must be > 0", kind);
            }
        }

        if self.api.bind_address.trim().is_empty() {
            anyhow::bail!("API bind_address cannot be empty");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        // Validate logging format
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }

    /// Expand environment variables in the format `${VAR_NAME}`.
    ///
    /// Placeholders inside TOML comments are left alone; placeholders inside
    /// any string form are expanded.
    ///
    /// # Errors
    /// Returns an error if a referenced environment variable is not set or a
    /// placeholder is malformed.
    fn expand_env_vars(input: &str) -> Result<String> {
        let mut result = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();
        let mut in_double_quote = false;
        let mut in_single_quote = false;
        let mut in_multiline_double = false;
        let mut in_multiline_single = false;
        let mut in_comment = false;
        let mut escape_next = false;
        let mut pos = 0;

        while let Some(ch) = chars.next() {
            pos += 1;

            if escape_next {
                escape_next = false;
                result.push(ch);
                continue;
            }

            if ch == '\\' && (in_double_quote || in_multiline_double) {
                escape_next = true;
                result.push(ch);
                continue;
            }

            let in_any_string =
                in_double_quote || in_single_quote || in_multiline_double || in_multiline_single;

            if ch == '"' && !in_single_quote && !in_multiline_single && !in_comment {
                if Self::take_triple_quote(&mut chars, '"') {
                    in_multiline_double = !in_multiline_double;
                    result.push_str("\"\"\"");
                    pos += 2;
                } else {
                    if !in_multiline_double {
                        in_double_quote = !in_double_quote;
                    }
                    result.push(ch);
                }
            } else if ch == '\'' && !in_double_quote && !in_multiline_double && !in_comment {
                if Self::take_triple_quote(&mut chars, '\'') {
                    in_multiline_single = !in_multiline_single;
                    result.push_str("'''");
                    pos += 2;
                } else {
                    if !in_multiline_single {
                        in_single_quote = !in_single_quote;
                    }
                    result.push(ch);
                }
            } else if ch == '#' && !in_any_string && !in_comment {
                in_comment = true;
                result.push(ch);
            } else if ch == '\n' {
                in_comment = false;
                result.push(ch);
            } else if ch == '$' && !in_comment && chars.peek() == Some(&'{') {
                chars.next();
                pos += 1;

                let mut var_name = String::new();
                let mut found_close = false;
                for c in chars.by_ref() {
                    pos += 1;
                    if c == '}' {
                        found_close = true;
                        break;
                    }
                    var_name.push(c);
                }

                if !found_close {
                    anyhow::bail!(
                        "Unclosed environment variable placeholder at position {}",
                        pos
                    );
                }

                if var_name.is_empty() {
                    anyhow::bail!("Empty environment variable name at position {}", pos);
                }

                match std::env::var(&var_name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        anyhow::bail!(
                            "Environment variable '{}' is not set (referenced at position {})",
                            var_name,
                            pos
                        );
                    }
                }
            } else {
                result.push(ch);
            }
        }

        Ok(result)
    }

    /// Consume the next two characters if they complete a triple quote.
    fn take_triple_quote(chars: &mut std::iter::Peekable<std::str::Chars>, quote_char: char) -> bool {
        let mut lookahead = chars.clone();
        if lookahead.next() == Some(quote_char) && lookahead.next() == Some(quote_char) {
            chars.next();
            chars.next();
            true
        } else {
            false
        }
    }
}
