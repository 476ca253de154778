//! Configuration file: a `general` section plus an ordered list of sources.
//!
//! JSON by default; a `.toml` extension switches the parser.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::dedup::DEFAULT_TTL_DAYS;
use crate::notify::{NotifierConfig, NotifierOverride};

pub const ENV_PATH: &str = "NEWSFEEDS_CONFIG";
pub const DEFAULT_PATH: &str = "/etc/newsfeeds/config.json";
pub const MIN_POLL_SECONDS: u64 = 30;
const DEFAULT_POLL_SECONDS: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_seen_path")]
    pub seen_store_path: PathBuf,
    #[serde(default = "default_ttl_days")]
    pub seen_ttl_days: u64,
    /// Seconds to sleep after a cycle that polled something.
    #[serde(default = "default_sleep_min")]
    pub sleep_min: u64,
    /// Seconds to sleep after an idle cycle.
    #[serde(default = "default_sleep_max")]
    pub sleep_max: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// `host:port` for the Prometheus `/metrics` endpoint; off when unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_seen_path() -> PathBuf {
    PathBuf::from("seen.json")
}
fn default_ttl_days() -> u64 {
    DEFAULT_TTL_DAYS
}
fn default_sleep_min() -> u64 {
    1
}
fn default_sleep_max() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_user_agent() -> String {
    concat!("newsfeeds/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            seen_store_path: default_seen_path(),
            seen_ttl_days: default_ttl_days(),
            sleep_min: default_sleep_min(),
            sleep_max: default_sleep_max(),
            log_level: default_log_level(),
            user_agent: default_user_agent(),
            location: None,
            notifier: NotifierConfig::default(),
            metrics_addr: None,
        }
    }
}

impl GeneralConfig {
    pub fn location(&self) -> Result<Location> {
        self.location
            .ok_or_else(|| anyhow!("general.location {{lat, lon}} is required by this source"))
    }
}

/// Closed set of feed kinds. Older configs name them by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[serde(alias = "NWS")]
    Nws,
    #[serde(alias = "USGS")]
    Usgs,
    #[serde(alias = "Caltrans")]
    Caltrans,
    #[serde(alias = "PulsePoint")]
    Pulsepoint,
    #[serde(alias = "PAO")]
    Pao,
    #[serde(alias = "AmbientWeather")]
    Telemetry,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Nws => "nws",
            SourceKind::Usgs => "usgs",
            SourceKind::Caltrans => "caltrans",
            SourceKind::Pulsepoint => "pulsepoint",
            SourceKind::Pao => "pao",
            SourceKind::Telemetry => "telemetry",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "class")]
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub notifier: Option<NotifierOverride>,
    /// Keys not listed above (e.g. listener sections kept at top level).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}
fn default_poll_seconds() -> u64 {
    DEFAULT_POLL_SECONDS
}

impl SourceConfig {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.kind.to_string())
    }

    /// Configured interval, never below the 30 s floor.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds.max(MIN_POLL_SECONDS))
    }

    /// Deserialize `params` into a kind-specific struct; missing params
    /// are treated as `{}` so every field falls back to its default.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let v = match &self.params {
            Value::Null => Value::Object(Map::new()),
            v => v.clone(),
        };
        serde_json::from_value(v)
            .with_context(|| format!("invalid params for source {}", self.display_name()))
    }
}

impl Config {
    /// Parse from a string, using `ext` ("toml" or anything else for JSON).
    pub fn parse(s: &str, ext: &str) -> Result<Self> {
        if ext.eq_ignore_ascii_case("toml") {
            toml::from_str(s).context("parsing TOML config")
        } else {
            serde_json::from_str(s).context("parsing JSON config")
        }
    }

    /// Load from `path`; a relative `seen_store_path` is resolved against
    /// the config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let mut cfg = Self::parse(&content, ext)
            .with_context(|| format!("in {}", path.display()))?;

        if cfg.general.seen_store_path.is_relative() {
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            cfg.general.seen_store_path = base.join(&cfg.general.seen_store_path);
        }
        if cfg.general.sleep_min > cfg.general.sleep_max {
            tracing::warn!(
                sleep_min = cfg.general.sleep_min,
                sleep_max = cfg.general.sleep_max,
                "sleep_min is larger than sleep_max"
            );
        }
        Ok(cfg)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Which config file to read:
/// 1) explicit `--config`
/// 2) `$NEWSFEEDS_CONFIG`
/// 3) `./config.json` if it exists
/// 4) `/etc/newsfeeds/config.json`
pub fn resolve_path(cli: Option<PathBuf>) -> PathBuf {
    if let Some(p) = cli {
        return p;
    }
    if let Ok(p) = std::env::var(ENV_PATH) {
        if !p.trim().is_empty() {
            return PathBuf::from(p);
        }
    }
    let cwd = PathBuf::from("config.json");
    if cwd.exists() {
        return cwd;
    }
    PathBuf::from(DEFAULT_PATH)
}
