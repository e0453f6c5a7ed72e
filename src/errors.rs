//! Error types shared across the orchestrator.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all orchestrator failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Backend RPC failure (transport error or unexpected response).
    Backend(String),
    /// Container runtime failure while creating, stopping or inspecting containers.
    Runner(String),
    /// Bookkeeping invariant was violated, e.g. an agent moving between executions.
    Invariant(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// HTTP server failure.
    Http(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Backend(msg) => write!(f, "backend: {msg}"),
            Self::Runner(msg) => write!(f, "runner: {msg}"),
            Self::Invariant(msg) => write!(f, "invariant violated: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
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

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
