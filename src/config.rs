use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "friend-circle.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret required by `/fetch`. Empty disables the endpoint.
    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    /// Refresh interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Location of the JSON friend list
    #[serde(default)]
    pub friends_url: String,
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    /// Also append logs to this file when set
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_port() -> u16 {
    8080
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_output_file() -> PathBuf {
    PathBuf::from("data/feed.json")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            secret_key: String::new(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            friends_url: String::new(),
            output_file: default_output_file(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Loads `path` if it exists, applies environment overrides and validates
    /// the result. A missing file just means "defaults plus environment".
    pub fn from_file_and_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from variables resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SERVER_PORT") {
            self.server.port = parse_env("SERVER_PORT", value)?;
        }
        if let Some(value) = lookup("SECRET_KEY") {
            self.server.secret_key = value;
        }
        if let Some(value) = lookup("REFRESH_INTERVAL") {
            self.crawl.refresh_interval = parse_env("REFRESH_INTERVAL", value)?;
        }
        if let Some(value) = lookup("RSS_CONFIG_URL") {
            self.crawl.friends_url = value;
        }
        if let Some(value) = lookup("OUTPUT_FILE") {
            self.crawl.output_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("LOG_FILE") {
            self.log.file = Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crawl.refresh_interval == 0 {
            return Err(ConfigError::Invalid(
                "refresh_interval must be positive".to_string(),
            ));
        }
        if self.crawl.refresh_interval.checked_mul(60).is_none() {
            return Err(ConfigError::Invalid(format!(
                "refresh_interval of {} minutes is too large",
                self.crawl.refresh_interval
            )));
        }
        if self.crawl.friends_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "friends_url (RSS_CONFIG_URL) is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}
