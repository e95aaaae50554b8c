//! Typed error hierarchy for the proxy core.

use thiserror::Error;

/// Errors produced by the proxy's component boundaries.
///
/// CLI-level code generally works in `anyhow::Result` (matching the
/// teacher's `cli::run`); this enum exists so library code can match on
/// error kind instead of string content, and so tests can assert on it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("rule file error: {0}")]
    RuleFile(String),

    #[error("local response error: {0}")]
    LocalResponse(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("session error: {0}")]
    Session(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
