//! Configuration loader and validator for the quick-post client.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::IMAGE_NAME_TOKEN;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// `config.yaml`, one struct per top-level section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub endpoint: Endpoint,
    pub sync: SyncPolicy,
    pub publish: Publish,
}

/// Local state location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Remote publishing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Background retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPolicy {
    pub initial_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub probe_interval_ms: u64,
}

/// Defaults applied to every composed post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publish {
    pub image_path: String,
    pub shortcode_template: String,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

impl Config {
    /// Create `app.data_dir` so the queue database can be opened inside it.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        match self.app.data_dir.trim() {
            "" => Ok(()),
            dir => fs::create_dir_all(dir),
        }
    }

    /// SQLite URL for the queue database, honouring `DATABASE_URL` when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/quickpost.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

impl Endpoint {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SyncPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Read, parse and validate the config at `path` (`./config.yaml` when `None`).
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path.unwrap_or(Path::new("config.yaml")))?;
    let cfg = serde_yaml::from_str::<Config>(&raw)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must not be blank"));
    }

    let base = cfg.endpoint.base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::Invalid("endpoint.base_url must be non-empty"));
    }
    if reqwest::Url::parse(base).is_err() {
        return Err(ConfigError::Invalid("endpoint.base_url must be an absolute URL"));
    }
    if cfg.endpoint.connect_timeout_secs == 0 || cfg.endpoint.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("endpoint timeouts must be > 0"));
    }

    if cfg.sync.initial_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("sync.initial_backoff_seconds must be > 0"));
    }
    if cfg.sync.max_backoff_seconds < cfg.sync.initial_backoff_seconds {
        return Err(ConfigError::Invalid(
            "sync.max_backoff_seconds must be >= sync.initial_backoff_seconds",
        ));
    }
    if cfg.sync.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("sync.probe_interval_ms must be > 0"));
    }

    if cfg.publish.image_path.trim().is_empty() {
        return Err(ConfigError::Invalid("publish.image_path must be non-empty"));
    }
    if !cfg.publish.shortcode_template.contains(IMAGE_NAME_TOKEN) {
        return Err(ConfigError::Invalid(
            "publish.shortcode_template must contain IMAGE_NAME",
        ));
    }

    Ok(())
}

/// Starter `config.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

endpoint:
  base_url: "https://post-to-status.vercel.app/api/"
  connect_timeout_secs: 30
  request_timeout_secs: 60

sync:
  initial_backoff_seconds: 60
  max_backoff_seconds: 3600
  probe_interval_ms: 5000

publish:
  image_path: "assets/img"
  shortcode_template: "{{< img src=\"/img/IMAGE_NAME\" >}}"
"#
}
