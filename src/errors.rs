//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all host-side failure modes.
///
/// Failures of a single tool call are not represented here: they travel back
/// into the isolated code as [`ToolError`](crate::sandbox::ToolError) values
/// and never abort an execution on their own.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Message channel to an isolated context failed or is closed.
    Transport(String),
    /// The isolated context answered a host call with an error.
    Rpc(String),
    /// A handshake, call, or execution deadline elapsed.
    Timeout(String),
    /// Trace synchronisation with the remote store failed.
    Sync(String),
    /// Session registration or heartbeat failure.
    Session(String),
    /// HTTP client failure talking to the remote authority.
    Http(String),
    /// Requested entity does not exist (or has expired).
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Sync(msg) => write!(f, "sync: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(format!("http request timed out: {err}"))
        } else {
            Self::Http(err.to_string())
        }
    }
}
