//! Loader for the relay configuration with file + environment overlays.
//!
//! Sources are merged in order: config file (TOML/YAML, format inferred by
//! suffix), then `PERCH_`-prefixed environment variables, then recursive
//! `${VAR}` expansion inside string values so credentials can live in the
//! environment while the file stays checkable into version control.
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use perch_common::MonitoredSource;

const MAXIMUM_ENV_EXPANSION_DEPTH: usize = 8;

#[derive(Debug, Deserialize)]
pub struct PerchConfig {
    pub version: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    pub twitter: TwitterConfig,
    pub telegram: TelegramConfig,
    /// One entry per monitored upstream account.
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Delivery records retained per source before the cursor alone is trusted.
    #[serde(default = "default_retention")]
    pub retention_per_source: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            retention_per_source: default_retention(),
        }
    }
}

/// Knobs for the poll scheduler and relay pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Global budget: at most this many fetches in flight across all sources.
    #[serde(default = "default_budget")]
    pub max_concurrent_fetches: usize,
    /// Page cap per poll; the remainder is deferred to the next cycle.
    #[serde(default = "default_page_cap")]
    pub max_items_per_poll: u32,
    #[serde(default = "default_poll_interval")]
    pub default_poll_interval_secs: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// How long a source stays paused after an auth failure.
    #[serde(default = "default_auth_retry")]
    pub auth_retry_secs: u64,
    /// In-cycle attempts per item on transient sink failures.
    #[serde(default = "default_delivery_attempts")]
    pub delivery_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_budget(),
            max_items_per_poll: default_page_cap(),
            default_poll_interval_secs: default_poll_interval(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            auth_retry_secs: default_auth_retry(),
            delivery_attempts: default_delivery_attempts(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TwitterConfig {
    pub bearer_token: String,
    #[serde(default = "default_twitter_endpoint")]
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Override for self-hosted bot API servers.
    #[serde(default = "default_telegram_endpoint")]
    pub base_url: String,
}

/// One monitored account: upstream id, destination chat, optional overrides.
#[derive(Debug, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    pub destination: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl PerchConfig {
    /// Materialise the `[[sources]]` entries, filling per-source defaults
    /// from the relay section.
    pub fn monitored_sources(&self) -> Vec<MonitoredSource> {
        self.sources
            .iter()
            .map(|s| MonitoredSource {
                source_id: s.id.clone(),
                destination_id: s.destination.clone(),
                poll_interval: Duration::from_secs(
                    s.poll_interval_secs
                        .unwrap_or(self.relay.default_poll_interval_secs),
                ),
                enabled: s.enabled.unwrap_or(true),
            })
            .collect()
    }
}

fn default_database_url() -> String {
    "sqlite://perch.db".into()
}
fn default_retention() -> u32 {
    500
}
fn default_budget() -> usize {
    4
}
fn default_page_cap() -> u32 {
    100
}
fn default_poll_interval() -> u64 {
    60
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_cap() -> u64 {
    300
}
fn default_auth_retry() -> u64 {
    300
}
fn default_delivery_attempts() -> u32 {
    3
}
fn default_twitter_endpoint() -> String {
    "https://api.twitter.com".into()
}
fn default_telegram_endpoint() -> String {
    "https://api.telegram.org".into()
}

fn expand_env_in_value(v: &mut Value) {
    match v {
        Value::String(s) => {
            if s.contains('$') {
                let mut cur = std::mem::take(s);
                for _ in 0..MAXIMUM_ENV_EXPANSION_DEPTH {
                    let expanded = match shellexpand::env(&cur) {
                        Ok(cow) => cow.into_owned(),
                        Err(_) => cur.clone(),
                    };
                    if expanded == cur {
                        break;
                    }
                    cur = expanded;
                }
                *s = cur;
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(expand_env_in_value),
        Value::Object(obj) => obj.values_mut().for_each(expand_env_in_value),
        _ => {}
    }
}

/// Builder hiding the `config` crate wiring (file + env overrides).
pub struct PerchConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for PerchConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PerchConfigLoader {
    pub fn new() -> Self {
        Self {
            builder: Config::builder(),
        }
    }

    /// Attach a TOML/YAML/JSON file; the `config` crate infers format by suffix.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self.builder.add_source(File::from(path.as_ref()).required(true));
        self
    }

    /// Allow tests/CLI to merge inline TOML snippets.
    pub fn with_toml_str(mut self, toml: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(toml, config::FileFormat::Toml));
        self
    }

    /// Consume the builder and deserialize the merged sources.
    ///
    /// `PERCH_`-prefixed environment variables are merged last so they
    /// override file values. `${VAR}` placeholders are then expanded
    /// (recursively, with a depth cap to terminate on cycles) before
    /// materialising the typed config.
    pub fn load(self) -> Result<PerchConfig, ConfigError> {
        let cfg = self
            .builder
            .add_source(Environment::with_prefix("PERCH").separator("__"))
            .build()?;

        let mut v: Value = cfg.try_deserialize()?;
        expand_env_in_value(&mut v);

        let typed: PerchConfig =
            serde_json::from_value(v).map_err(|e| ConfigError::Message(e.to_string()))?;

        Ok(typed)
    }
}
