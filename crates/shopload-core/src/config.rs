use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::driver::ContentType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    #[serde(default = "default_clients")]
    pub clients: Vec<ClientProfile>,
    pub warmup: PhaseConfig,
    pub ramp: RampConfig,
    #[serde(default)]
    pub sustained: Option<PhaseConfig>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.base_url.trim().is_empty() {
            return Err(invalid("target.base_url", "must not be empty"));
        }
        self.target.validate_base_url()?;
        if self.clients.is_empty() {
            return Err(invalid("clients", "at least one client profile is required"));
        }
        if self.warmup.messages == 0 {
            return Err(invalid("warmup.messages", "must be non-zero"));
        }
        if self.ramp.messages == 0 {
            return Err(invalid("ramp.messages", "must be non-zero"));
        }
        if self.ramp.max_clients < self.ramp.initial_clients {
            return Err(invalid(
                "ramp.max_clients",
                format!(
                    "{} is below initial_clients {}",
                    self.ramp.max_clients, self.ramp.initial_clients
                ),
            ));
        }
        if self.ramp.step_clients == 0 && self.ramp.max_clients > self.ramp.initial_clients {
            return Err(invalid(
                "ramp.step_clients",
                "must be non-zero when max_clients exceeds initial_clients",
            ));
        }
        if let Some(sustained) = &self.sustained {
            if sustained.messages == 0 {
                return Err(invalid("sustained.messages", "must be non-zero"));
            }
        }
        if self.report.time_bucket_ms == 0 {
            return Err(invalid("report.time_bucket_ms", "must be non-zero"));
        }
        if !(self.report.percentile > 0.0 && self.report.percentile <= 100.0) {
            return Err(invalid(
                "report.percentile",
                format!("{} is outside (0, 100]", self.report.percentile),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the shop server, e.g. "http://localhost:8080"
    pub base_url: String,
    /// Idle connections kept per host; sized for the ramp ceiling
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tcp_keepalive_ms")]
    pub tcp_keepalive_ms: u64,
}

impl TargetConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            pool_max_idle_per_host: default_pool_max_idle(),
            pool_idle_timeout_ms: default_pool_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tcp_keepalive_ms: default_tcp_keepalive_ms(),
        }
    }

    /// Endpoints are joined onto the base URL, so it must point at the
    /// server root: an http(s) origin with no path, query or fragment.
    pub fn validate_base_url(&self) -> Result<url::Url, ConfigError> {
        let raw = self.base_url.as_str();
        let url = url::Url::parse(raw).map_err(|e| invalid("target.base_url", e.to_string()))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid(
                "target.base_url",
                format!("must be http:// or https:// (got {raw})"),
            ));
        }
        if url.host_str().is_none() {
            return Err(invalid("target.base_url", format!("must include a host (got {raw})")));
        }
        if url.path() != "/" {
            return Err(invalid(
                "target.base_url",
                format!("must not include a path (got path={})", url.path()),
            ));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid(
                "target.base_url",
                format!("must not include a query or fragment (got {raw})"),
            ));
        }
        Ok(url)
    }
}

/// Where a named client puts its user name on the listing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    #[default]
    Query,
    Body,
}

/// Shape of the `json` field when the user name travels in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NameFormat {
    /// `json=alice`
    #[default]
    Bare,
    /// `json={"name":"alice"}`
    Object,
}

/// Identity and encoding of one simulated client, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClientProfile {
    /// Empty means anonymous
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub name_format: NameFormat,
}

impl ClientProfile {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn named(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ..Self::default()
        }
    }
}

/// A fixed-size wave of clients: warm-up and the sustained profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub clients: u32,
    /// Message rounds per client
    pub messages: u32,
    /// Delay between rounds in milliseconds
    #[serde(default)]
    pub pacing_ms: u64,
}

impl PhaseConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    pub initial_clients: u32,
    /// Clients added on every tick
    pub step_clients: u32,
    /// Ceiling on the total number of clients spawned in the phase. Clients
    /// never respawn, so concurrency only approaches it when each client
    /// outlives the remaining waves.
    pub max_clients: u32,
    pub step_interval_ms: u64,
    pub messages: u32,
    #[serde(default)]
    pub pacing_ms: u64,
}

impl RampConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_time_bucket_ms")]
    pub time_bucket_ms: u64,
    #[serde(default = "default_percentile")]
    pub percentile: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            time_bucket_ms: default_time_bucket_ms(),
            percentile: default_percentile(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Append log lines to this file instead of stderr
    #[serde(default)]
    pub file: Option<String>,
}

fn default_clients() -> Vec<ClientProfile> {
    vec![ClientProfile::anonymous()]
}

fn default_pool_max_idle() -> usize {
    1024
}

fn default_pool_idle_timeout_ms() -> u64 {
    90_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_tcp_keepalive_ms() -> u64 {
    30_000
}

fn default_time_bucket_ms() -> u64 {
    1_000
}

fn default_percentile() -> f64 {
    95.0
}
