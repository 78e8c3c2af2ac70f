//! Exporter configuration: YAML file, environment overrides, log level.

use log::LevelFilter;
use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ExporterError, Result};

/// Netatmo OAuth2 token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://api.netatmo.com/oauth2/token";

/// Netatmo weather station listing endpoint.
pub const DEFAULT_STATIONS_URL: &str = "https://api.netatmo.com/api/getstationsdata";

/// Netatmo account and endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NetatmoConfig {
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// Seeds the very first refresh; later rotations live in the token file.
    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_stations_url")]
    pub stations_url: String,
}

impl Default for NetatmoConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            refresh_token: None,
            token_url: default_token_url(),
            stations_url: default_stations_url(),
        }
    }
}

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file did not exist.
    Defaults,
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Poll interval in seconds, also used as the retry delay.
    #[serde(default = "default_interval", deserialize_with = "number_or_string")]
    pub interval: u64,

    /// Log level name (DEBUG, INFO, WARNING, ERROR).
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// TCP port of the metrics endpoint.
    #[serde(default = "default_listen_port", deserialize_with = "number_or_string")]
    pub listen_port: u16,

    #[serde(default)]
    pub netatmo: NetatmoConfig,
}

/// Accept `300` as well as `"300"`.
fn number_or_string<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Number(T),
        Text(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn default_interval() -> u64 {
    300
}

fn default_loglevel() -> String {
    "INFO".to_string()
}

fn default_listen_port() -> u16 {
    9126
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_stations_url() -> String {
    DEFAULT_STATIONS_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            loglevel: default_loglevel(),
            listen_port: default_listen_port(),
            netatmo: NetatmoConfig::default(),
        }
    }
}

/// The three secrets needed to run the refresh-token grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the defaults so that a pure environment-variable
    /// setup works without any file on disk. The returned [`ConfigSource`]
    /// tells the caller which happened.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, ConfigSource)> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Self::default(), ConfigSource::Defaults));
            }
            Err(e) => {
                return Err(ExporterError::Config(format!(
                    "Failed to read config '{}': {}",
                    path.display(),
                    e
                )))
            }
        };
        let config = Self::parse(&contents).map_err(|e| match e {
            ExporterError::Config(msg) => {
                ExporterError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        Ok((config, ConfigSource::File))
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| match e.location() {
            Some(mark) => ExporterError::Config(format!(
                "syntax error at ({}:{}): {}",
                mark.line(),
                mark.column(),
                e
            )),
            None => ExporterError::Config(e.to_string()),
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Set values win over the file.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(interval) = lookup("INTERVAL") {
            self.interval = interval.trim().parse().map_err(|_| {
                ExporterError::Config(format!("INTERVAL is not a number: {}", interval))
            })?;
        }
        if let Some(level) = lookup("LOGLEVEL") {
            self.loglevel = level;
        }
        if let Some(port) = lookup("LISTEN_PORT") {
            self.listen_port = port.trim().parse().map_err(|_| {
                ExporterError::Config(format!("LISTEN_PORT is not a valid port: {}", port))
            })?;
        }
        if let Some(client_id) = lookup("NETATMO_CLIENT_ID") {
            self.netatmo.client_id = Some(client_id);
        }
        if let Some(client_secret) = lookup("NETATMO_CLIENT_SECRET") {
            self.netatmo.client_secret = Some(client_secret);
        }
        if let Some(refresh_token) = lookup("NETATMO_REFRESH_TOKEN") {
            self.netatmo.refresh_token = Some(refresh_token);
        }
        self.validate()
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(ExporterError::Config(
                "interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Return the account credentials, failing when any of them is missing.
    pub fn client_credentials(&self) -> Result<ClientCredentials> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        match (
            non_empty(&self.netatmo.client_id),
            non_empty(&self.netatmo.client_secret),
            non_empty(&self.netatmo.refresh_token),
        ) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => Ok(ClientCredentials {
                client_id,
                client_secret,
                refresh_token,
            }),
            _ => Err(ExporterError::Config(
                "No credentials supplied. No Netatmo Account available.".to_string(),
            )),
        }
    }

    /// Resolve the effective log level.
    ///
    /// `LOGLEVEL` (already folded into `self.loglevel` when set) beats the
    /// verbosity flag, which beats the file value. Unknown names fall back to info.
    pub fn log_level(&self, verbosity: u8, env_override: bool) -> LevelFilter {
        let name = if !env_override && verbosity > 0 {
            match verbosity {
                1 => "WARNING",
                2 => "INFO",
                _ => "DEBUG",
            }
        } else {
            self.loglevel.as_str()
        };
        parse_level_name(name).unwrap_or(LevelFilter::Info)
    }
}

/// Map a classic level name to a `log` filter.
pub fn parse_level_name(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_uppercase().as_str() {
        "NOTSET" | "TRACE" => Some(LevelFilter::Trace),
        "DEBUG" => Some(LevelFilter::Debug),
        "INFO" => Some(LevelFilter::Info),
        "WARNING" | "WARN" => Some(LevelFilter::Warn),
        "ERROR" | "CRITICAL" => Some(LevelFilter::Error),
        "OFF" => Some(LevelFilter::Off),
        _ => None,
    }
}
