//! Configuration system for autosync
//!
//! Supports TOML configuration files with sensible defaults. Command line
//! flags are merged on top through [`ConfigOverrides`].
//!
//! The file is loaded from:
//! - macOS: ~/Library/Application Support/autosync/config.toml
//! - Linux: ~/.config/autosync/config.toml
//! - Windows: %APPDATA%/autosync/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::DEFAULT_CALLBACK_MARKER;

/// Upper bound for `wait`, `interval` and `refresh`
pub const MAX_PERIOD_MINUTES: u64 = 365 * 24 * 60;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port the callback listener binds (random when unset)
    pub port: Option<u16>,
    /// Port registered in the callback URL when forwarding is set up outside
    pub external_port: Option<u16>,
    /// Minutes between forced syncs without an active callback
    pub wait: u64,
    /// Minutes between syncs while a callback is active
    pub interval: u64,
    /// Minutes between callback re-registrations
    pub refresh: u64,
    /// Public host name used in the callback URL (reverse proxy deployments)
    pub callback_host: Option<String>,
    /// Secret path segment of the callback URL
    pub callback_marker: String,
    /// Trust every source address (only behind a trusted reverse proxy)
    pub skip_ip_validation: bool,
    /// Consecutive failures before an alert mail is sent
    pub mail_after_errors: u32,
    /// Extra CIDR ranges accepted as callback sources
    pub trusted_networks: Vec<String>,
    /// Alert mail settings
    pub smtp: SmtpConfig,
    /// External programs the daemon delegates to
    pub commands: CommandsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            external_port: None,
            wait: 60,
            interval: 4 * 60,
            refresh: 8 * 60,
            callback_host: None,
            callback_marker: DEFAULT_CALLBACK_MARKER.to_string(),
            skip_ip_validation: false,
            mail_after_errors: 5,
            trusted_networks: Vec::new(),
            smtp: SmtpConfig::default(),
            commands: CommandsConfig::default(),
        }
    }
}

/// SMTP settings for failure alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Mail server host name
    pub server: Option<String>,
    /// Mail server port (25 uses STARTTLS, anything else implicit TLS)
    pub port: u16,
    /// Login user, also the default recipient
    pub user: Option<String>,
    /// Login password (no authentication when unset)
    pub password: Option<String>,
    /// Sender address (defaults to autosync@<hostname>)
    pub from: Option<String>,
    /// Comma-separated recipients (defaults to `user`)
    pub to: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: 465,
            user: None,
            password: None,
            from: None,
            to: None,
        }
    }
}

/// Commands implementing the synchronization and bank callback API
///
/// Each command is an argv list; arguments are appended as documented per
/// field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Runs one synchronization
    pub sync: Vec<String>,
    /// Prints whitespace-separated bank user ids
    pub user_ids: Vec<String>,
    /// Registers a callback: `<user> <marker> <url>`
    pub add_callback: Vec<String>,
    /// Removes a callback: `<user> <marker>`
    pub remove_callback: Vec<String>,
}

/// Values given on the command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub external_port: Option<u16>,
    pub wait: Option<u64>,
    pub interval: Option<u64>,
    pub refresh: Option<u64>,
    pub callback_host: Option<String>,
    pub callback_marker: Option<String>,
    pub skip_ip_validation: bool,
    pub mail_after_errors: Option<u32>,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No config directory found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "autosync", "autosync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Merge command line values; anything given there wins
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if overrides.port.is_some() {
            self.port = overrides.port;
        }
        if overrides.external_port.is_some() {
            self.external_port = overrides.external_port;
        }
        if let Some(wait) = overrides.wait {
            self.wait = wait;
        }
        if let Some(interval) = overrides.interval {
            self.interval = interval;
        }
        if let Some(refresh) = overrides.refresh {
            self.refresh = refresh;
        }
        if overrides.callback_host.is_some() {
            self.callback_host = overrides.callback_host;
        }
        if let Some(marker) = overrides.callback_marker {
            self.callback_marker = marker;
        }
        if overrides.skip_ip_validation {
            self.skip_ip_validation = true;
        }
        if let Some(n) = overrides.mail_after_errors {
            self.mail_after_errors = n;
        }
    }

    /// Check values that would otherwise fail deep inside the loop
    pub fn validate(&self) -> Result<(), ConfigError> {
        let marker = &self.callback_marker;
        if marker.is_empty() || marker.contains('/') || marker.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                key: "callback_marker",
                reason: format!("{:?} must be a single non-empty path segment", marker),
            });
        }
        for (key, minutes) in [
            ("wait", self.wait),
            ("interval", self.interval),
            ("refresh", self.refresh),
        ] {
            if minutes == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be at least one minute".into(),
                });
            }
            if minutes > MAX_PERIOD_MINUTES {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("must be at most {} minutes (one year)", MAX_PERIOD_MINUTES),
                });
            }
        }
        if self.port == Some(0) || self.external_port == Some(0) {
            return Err(ConfigError::Invalid {
                key: "port",
                reason: "port 0 is not allowed, leave it unset for a random port".into(),
            });
        }
        if let Some(host) = &self.callback_host {
            if host.is_empty() || host.contains('/') {
                return Err(ConfigError::Invalid {
                    key: "callback_host",
                    reason: format!("{:?} must be a bare host name", host),
                });
            }
        }
        self.trusted_networks()?;
        Ok(())
    }

    /// Parsed `trusted_networks`
    pub fn trusted_networks(&self) -> Result<Vec<IpNetwork>, ConfigError> {
        self.trusted_networks
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNetwork>().map_err(|e| ConfigError::Invalid {
                    key: "trusted_networks",
                    reason: format!("{}: {}", cidr, e),
                })
            })
            .collect()
    }

    /// Forced sync period without a callback
    pub fn wait_duration(&self) -> Duration {
        minutes(self.wait)
    }

    /// Sync period while a callback is registered
    pub fn interval_duration(&self) -> Duration {
        minutes(self.interval)
    }

    /// Callback re-registration period
    pub fn refresh_duration(&self) -> Duration {
        minutes(self.refresh)
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.min(MAX_PERIOD_MINUTES) * 60)
}
