//! Process configuration.
//!
//! Environment variables are the primary source; a JSON config file is
//! the fallback for anything the environment leaves unset. Credentials
//! only ever come from the environment and never appear in the
//! non-secret view or the logs.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// File half of the configuration; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    store_path: Option<PathBuf>,
    user_agent: Option<String>,
    forum_url: Option<String>,
    forum_rate: Option<f64>,
    forum_max_rate: Option<f64>,
    shared_pacing: Option<bool>,
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub store_path: PathBuf,
    pub user_agent: Option<String>,
    /// Forum API origin override (mock servers, regional mirrors).
    pub forum_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Initial forum pacing, permits per second.
    pub forum_rate: f64,
    /// Ceiling the adaptive policy may recover to.
    pub forum_max_rate: f64,
    /// Use the process-shared pacing variant backed by the store file.
    pub shared_pacing: bool,
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub success_threshold: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            store_path: PathBuf::from("snooscope.db"),
            user_agent: None,
            forum_url: None,
            client_id: None,
            client_secret: None,
            forum_rate: 1.0,
            forum_max_rate: 4.0,
            shared_pacing: false,
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl AppConfig {
    /// Loads configuration: defaults, then the config file (if any),
    /// then the environment on top.
    pub fn load() -> Result<Self, ConfigError> {
        let file_path = std::env::var_os("SNOOSCOPE_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from("snooscope.json");
                default.exists().then_some(default)
            });
        let file = match &file_path {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, |name| std::env::var(name).ok())
    }

    fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(bind) = env("SNOOSCOPE_BIND").or(file.bind) {
            config.bind = bind.parse().map_err(|_| ConfigError::Invalid {
                name: "SNOOSCOPE_BIND".into(),
                reason: format!("{bind:?} is not a socket address"),
            })?;
        }
        if let Some(path) = env("SNOOSCOPE_STORE").map(PathBuf::from).or(file.store_path) {
            config.store_path = path;
        }
        config.user_agent = env("SNOOSCOPE_USER_AGENT").or(file.user_agent);
        config.forum_url = env("SNOOSCOPE_FORUM_URL").or(file.forum_url);
        config.client_id = env("REDDIT_CLIENT_ID");
        config.client_secret = env("REDDIT_CLIENT_SECRET");

        if let Some(rate) = env("SNOOSCOPE_RATE")
            .map(|v| parse_rate("SNOOSCOPE_RATE", &v))
            .transpose()?
            .or(file.forum_rate)
        {
            config.forum_rate = rate;
        }
        if let Some(rate) = env("SNOOSCOPE_MAX_RATE")
            .map(|v| parse_rate("SNOOSCOPE_MAX_RATE", &v))
            .transpose()?
            .or(file.forum_max_rate)
        {
            config.forum_max_rate = rate;
        }
        if let Some(shared) = env("SNOOSCOPE_SHARED_PACING")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(file.shared_pacing)
        {
            config.shared_pacing = shared;
        }

        if config.forum_rate <= 0.0 || config.forum_max_rate < config.forum_rate {
            return Err(ConfigError::Invalid {
                name: "SNOOSCOPE_RATE".into(),
                reason: "rate must be positive and no greater than the max rate".into(),
            });
        }
        Ok(config)
    }

    /// Everything a dashboard may see. Credentials reduce to presence.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "bind": self.bind.to_string(),
            "store_path": self.store_path.display().to_string(),
            "forum_rate": self.forum_rate,
            "forum_max_rate": self.forum_max_rate,
            "shared_pacing": self.shared_pacing,
            "failure_threshold": self.failure_threshold,
            "cool_down_secs": self.cool_down.as_secs(),
            "has_credentials": self.client_id.is_some() && self.client_secret.is_some(),
        })
    }
}

fn parse_rate(name: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::Invalid {
        name: name.into(),
        reason: format!("{value:?} is not a number"),
    })
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
