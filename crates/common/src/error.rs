use thiserror::Error;
use uuid::Uuid;

/// Infrastructure errors raised by persistence, cache and bus adapters.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced synchronously by the dispatch service.
///
/// Channel delivery failures never show up here; they are recorded on the
/// attempt history and visible only through a status query.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate submission of notification {existing_id}")]
    DuplicateSubmission { existing_id: Uuid },

    #[error("Notification {0} not found")]
    NotFound(Uuid),

    #[error("Notification {0} has no channel left to cancel")]
    NotCancellable(Uuid),

    #[error("Infrastructure unavailable: {0}")]
    InfrastructureUnavailable(#[from] AppError),

    /// A bug in the caller, such as requesting a forbidden state change.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable reason code for callers of the intake boundary.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation_error",
            DispatchError::DuplicateSubmission { .. } => "duplicate_submission",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::NotCancellable(_) => "not_cancellable",
            DispatchError::InfrastructureUnavailable(_) => "infrastructure_unavailable",
            DispatchError::Internal(_) => "internal_error",
        }
    }

    /// The id a duplicate submission resolved to, if this is one.
    pub fn existing_id(&self) -> Option<Uuid> {
        match self {
            DispatchError::DuplicateSubmission { existing_id } => Some(*existing_id),
            _ => None,
        }
    }
}

/// Outcome of a failed channel send, as classified by the channel adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Worth retrying (network, rate limit, recipient offline).
    #[error("Transient channel error: {0}")]
    Transient(String),

    /// Retrying cannot help (rejected recipient, bad payload).
    #[error("Terminal channel error: {0}")]
    Terminal(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Transient(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            ChannelError::Transient(msg) | ChannelError::Terminal(msg) => msg,
        }
    }
}
