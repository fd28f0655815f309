use thiserror::Error;

/// Errors surfaced by a [`crate::Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Busy/locked database, dropped connection, pool exhaustion. Safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violated: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid user preferences: {0}")]
    InvalidPreferences(String),

    #[error("invalid lexicon table: {0}")]
    InvalidLexicon(String),
}
