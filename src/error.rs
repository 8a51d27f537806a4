//! Error types for printd.

use std::path::PathBuf;

/// Top-level error type for the mailbot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mail transport errors (IMAP session and SMTP submission).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP login failed for {username}: {reason}")]
    AuthFailed { username: String, reason: String },

    #[error("IMAP command {command} rejected: {status} {text}")]
    Rejected {
        command: String,
        status: String,
        text: String,
    },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Server closed the connection: {0}")]
    Bye(String),

    #[error("Not connected")]
    NotConnected,

    #[error("SMTP send failed: {0}")]
    Smtp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Compose(#[from] ComposeError),
}

/// Reply composition errors.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid content type {0:?}")]
    InvalidContentType(String),

    #[error("Failed to build message: {0}")]
    Build(String),
}

/// Result type alias for the mailbot.
pub type Result<T> = std::result::Result<T, Error>;
