use thiserror::Error;

#[derive(Error, Debug)]
pub enum SitepulseError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid sitemap: {0}")]
    InvalidSitemap(String),

    #[error("InvalidCredential: {0}")]
    InvalidCredential(String),

    #[error("Encryption key must be at least 32 characters")]
    WeakEncryptionKey,

    #[error("QuotaExhausted: daily quota used up ({used}/{limit})")]
    QuotaExhausted { used: i64, limit: i64 },

    #[error("QuotaExceeded: {0}")]
    QuotaExceeded(String),

    #[error("PermissionDenied: {0}")]
    PermissionDenied(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job Aborted")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SitepulseError {
    /// Whether the broker should redeliver the job after a delay.
    /// Application-level fatals short-circuit retry; only transient
    /// failures go back to the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SitepulseError::Transient(_) | SitepulseError::Database(_))
    }

    /// Coarse kind label used for the `errors_total{kind}` counter.
    pub fn kind(&self) -> &'static str {
        match self {
            SitepulseError::Database(_) => "database",
            SitepulseError::InvalidSitemap(_) => "invalid_input",
            SitepulseError::InvalidCredential(_) | SitepulseError::WeakEncryptionKey => {
                "credential"
            }
            SitepulseError::QuotaExhausted { .. } | SitepulseError::QuotaExceeded(_) => "quota",
            SitepulseError::PermissionDenied(_) => "permission",
            SitepulseError::Transient(_) => "transient",
            SitepulseError::Conflict(_) => "conflict",
            SitepulseError::NotFound(_) => "not_found",
            SitepulseError::Aborted => "aborted",
            SitepulseError::Config(_) => "config",
            SitepulseError::Anyhow(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, SitepulseError>;
