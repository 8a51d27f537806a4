//! Configuration types.
//!
//! Loaded from a TOML file (path from `PRINTD_CONFIG`, default
//! `/etc/printd.toml`). Passwords can be overridden from the environment
//! so they need not live in the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::auth::AuthPolicy;
use crate::error::ConfigError;
use crate::jobs::print::PrintConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PRINTD_CONFIG";

/// Config file used when `PRINTD_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/printd.toml";

/// Default display name of the bot.
pub const DEFAULT_MAILNAME: &str = "Print";

/// How a mail session is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS from the first byte (IMAPS 993, SMTPS 465).
    Tls,
    /// Plain connect, then upgrade (IMAP 143, submission 587).
    #[default]
    Starttls,
}

/// Inbound (IMAP) settings.
#[derive(Debug, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(deserialize_with = "secret")]
    pub password: SecretString,
    #[serde(default)]
    pub tls: TlsMode,
    /// The single monitored folder.
    #[serde(default = "default_folder")]
    pub folder: String,
}

impl ImapConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.tls {
            TlsMode::Tls => 993,
            TlsMode::Starttls => 143,
        })
    }
}

/// Outbound (SMTP) settings. Credentials default to the IMAP ones.
#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "optional_secret")]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub tls: TlsMode,
}

impl SmtpConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.tls {
            TlsMode::Tls => 465,
            TlsMode::Starttls => 587,
        })
    }
}

/// Loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimingConfig {
    /// Maximum idle wait before re-polling unconditionally.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Sleep after a failed connect.
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

impl TimingConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Deserialize)]
pub struct MailbotConfig {
    /// The bot's own address; mail from it is never processed.
    pub mailaddr: String,
    #[serde(default = "default_mailname")]
    pub mailname: Option<String>,
    /// Receives failure reports, unauthorized-attempt notices and blind copies.
    pub adminaddr: String,
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    pub users: AuthPolicy,
    #[serde(default)]
    pub print: PrintConfig,
    /// Keys this version does not understand; reported, never fatal.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl MailbotConfig {
    /// Path of the config file from the environment.
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse without touching the environment or validating.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        for key in config.unknown.keys() {
            warn!(key = %key, "Unused configuration key");
        }
        Ok(config)
    }

    /// Override passwords from `PRINTD_IMAP_PASSWORD` / `PRINTD_SMTP_PASSWORD`.
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var("PRINTD_IMAP_PASSWORD") {
            self.imap.password = SecretString::from(password);
        }
        if let Ok(password) = std::env::var("PRINTD_SMTP_PASSWORD") {
            self.smtp.password = Some(SecretString::from(password));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("mailaddr", &self.mailaddr),
            ("adminaddr", &self.adminaddr),
            ("imap.host", &self.imap.host),
            ("imap.username", &self.imap.username),
            ("smtp.host", &self.smtp.host),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: key.to_string(),
                    hint: "Set it in the config file.".to_string(),
                });
            }
        }
        if !self.mailaddr.contains('@') {
            return Err(ConfigError::InvalidValue {
                key: "mailaddr".to_string(),
                message: format!("{:?} is not an email address", self.mailaddr),
            });
        }
        if self.users.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "users".to_string(),
                hint: "Add at least one sender (or ALL) to the [users] table.".to_string(),
            });
        }
        if self.timing.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "timing.idle_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// SMTP username, falling back to the IMAP one.
    pub fn smtp_username(&self) -> &str {
        self.smtp.username.as_deref().unwrap_or(&self.imap.username)
    }

    /// SMTP password, falling back to the IMAP one.
    pub fn smtp_password(&self) -> &str {
        self.smtp
            .password
            .as_ref()
            .unwrap_or(&self.imap.password)
            .expose_secret()
    }
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_mailname() -> Option<String> {
    Some(DEFAULT_MAILNAME.to_string())
}

fn default_idle_timeout_secs() -> u64 {
    25 * 60
}

fn default_reconnect_backoff_secs() -> u64 {
    5 * 60
}

fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

fn optional_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SecretString>, D::Error> {
    Option::<String>::deserialize(deserializer).map(|s| s.map(SecretString::from))
}
