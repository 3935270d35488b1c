use thiserror::Error;

/// Top-level error type for Polyvox operations.
#[derive(Debug, Error)]
pub enum PolyvoxError {
    // --- Hard dependency errors (system cannot function) ---
    #[error("PostgreSQL error: {0}")]
    Postgres(String),

    #[error("Redis error: {0}")]
    Redis(String),

    // --- Operational errors ---
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl PolyvoxError {
    /// Whether this error is from a hard dependency (broker or repository down).
    pub fn is_hard_dependency(&self) -> bool {
        matches!(self, Self::Postgres(_) | Self::Redis(_))
    }
}

/// Result type alias for Polyvox operations.
pub type Result<T> = std::result::Result<T, PolyvoxError>;
