use std::fmt;
use thiserror::Error;

use wavess_core::{ConfigError, StoreError};

/// Failure from a single provider call. Clients never retry; the orchestrator
/// decides what to do with each variant.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider deadline exceeded after {0}s")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("provider rejected request with {status}: {body}")]
    Client { status: u16, body: String },

    /// Content-policy refusal, either as an error status or as refusal text.
    #[error("content policy refusal: {0}")]
    Policy(String),

    #[error("undecodable provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_server(&self) -> bool {
        matches!(self, ProviderError::Server { .. })
    }
}

/// Stable labels for the error kinds callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ProviderTimeout,
    Provider5xx,
    Provider4xx,
    ProviderPolicy,
    ProviderTransport,
    SchemaViolation,
    StoreTransient,
    StoreConflict,
    InvalidInput,
    Store,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProviderTimeout => "provider_timeout",
            ErrorKind::Provider5xx => "provider_5xx",
            ErrorKind::Provider4xx => "provider_4xx",
            ErrorKind::ProviderPolicy => "provider_4xx_policy",
            ErrorKind::ProviderTransport => "provider_transport",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::StoreTransient => "store_transient",
            ErrorKind::StoreConflict => "store_conflict",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Store => "store",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure of one turn. A turn either completes or returns one of these.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("provider timed out after {0}s")]
    ProviderTimeout(u64),

    #[error(transparent)]
    Provider(ProviderError),

    #[error("provider output failed schema validation: {reason}")]
    SchemaViolation { reason: String, raw: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TurnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnError::ProviderTimeout(_) => ErrorKind::ProviderTimeout,
            TurnError::Provider(p) => match p {
                ProviderError::Timeout(_) => ErrorKind::ProviderTimeout,
                ProviderError::Server { .. } => ErrorKind::Provider5xx,
                ProviderError::Client { .. } => ErrorKind::Provider4xx,
                ProviderError::Policy(_) => ErrorKind::ProviderPolicy,
                ProviderError::Transport(_) => ErrorKind::ProviderTransport,
                ProviderError::Decode(_) => ErrorKind::SchemaViolation,
            },
            TurnError::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            TurnError::InvalidInput(_) | TurnError::Config(_) => ErrorKind::InvalidInput,
            TurnError::Store(StoreError::Transient(_)) => ErrorKind::StoreTransient,
            TurnError::Store(StoreError::Conflict(_)) => ErrorKind::StoreConflict,
            TurnError::Store(_) => ErrorKind::Store,
            TurnError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<ProviderError> for TurnError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout(secs) => TurnError::ProviderTimeout(secs),
            other => TurnError::Provider(other),
        }
    }
}
