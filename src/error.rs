//! Error taxonomy for the replay proxy.
//!
//! Mirrors the kinds enumerated in the spec's error handling design: each
//! client-visible error carries the HTTP status it maps to, so the
//! connection handler never has to pattern-match error internals to pick a
//! response code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WprError {
    #[error("address already in use: {0}")]
    Bind(std::io::Error),

    #[error("request line exceeds 65536 bytes")]
    RequestLineTooLong,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("missing Host header")]
    MissingHost,

    #[error("rule compile error: {0}")]
    RuleCompile(String),

    #[error("origin fetch failed after retries: {0}")]
    OriginFetch(String),

    #[error("archive I/O error: {0}")]
    ArchiveIo(#[from] std::io::Error),

    #[error("archive (de)serialization error: {0}")]
    ArchiveFormat(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WprError {
    /// Status code a malformed-request-class error should be answered with.
    /// Returns `None` for errors that are not meant to produce a client
    /// response at all (e.g. bind errors, which are fatal at startup).
    pub fn status_code(&self) -> Option<u16> {
        match self {
            WprError::RequestLineTooLong => Some(414),
            WprError::MalformedRequest(_) => Some(400),
            WprError::MissingHost => Some(500),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WprError>;
