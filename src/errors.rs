//! Application error model
//!
//! Defines typed error hierarchies using `thiserror`, one enum per concern
//! (config, store, extraction, watcher, protocol) rather than a single flat
//! error type, so each module's failure modes stay self-describing at the
//! call site.

use thiserror::Error;

/// Errors raised while loading or validating the YAML configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid extraction regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(
        "capture '{capture}' for pattern '{pattern}' is neither a named group nor a valid index"
    )]
    InvalidCapture { pattern: String, capture: String },
}

/// Errors raised by a [`crate::mailbox::MailboxStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mailbox '{0}' not found")]
    NotFound(String),
    #[error("mailbox '{0}' already exists")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while extracting a verification code from a message body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no extractor rule matched")]
    NotFound,
    #[error("message body could not be decoded")]
    BodyUnavailable,
}

/// Errors raised during a single [`crate::watcher::MailboxWatcher`] run.
///
/// Every variant is terminal: on any of these the watcher loop logs and
/// returns, leaving the supervisor's context reapable.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to connect to {server}:{port}: {source}")]
    Connect {
        server: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake with {server} failed: {source}")]
    Tls {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IMAP login failed for {email}")]
    AuthFailed { email: String },
    #[error("IMAP command failed: {0}")]
    Imap(#[from] async_imap::error::Error),
    #[error("IDLE protocol failed: {0}")]
    Idle(String),
}

pub type WatcherResult<T> = Result<T, WatcherError>;

/// Errors raised while decoding a [`crate::protocol::ControlMessage`] off the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown action code {0}")]
    UnknownAction(i64),
    #[error("missing required parameter '{0}'")]
    MissingParam(String),
    #[error("parameter '{name}' had the wrong type (expected {expected})")]
    WrongParamType { name: String, expected: String },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
