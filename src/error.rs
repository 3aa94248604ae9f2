use thiserror::Error;

/// Main error type for the forum core
#[derive(Debug, Error)]
pub enum ForumError {
    /// Origin row absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Vote submitted after the voting window closed
    #[error("Voting window has expired")]
    VoteTimeExpired,

    /// Same vote direction submitted twice
    #[error("Repeated vote is not allowed")]
    VoteRepeated,

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    RedisError(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Cache operation error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForumError {
    /// Equivalent error for callers that shared one failed operation
    pub fn shared_copy(&self) -> ForumError {
        match self {
            ForumError::NotFound(msg) => ForumError::NotFound(msg.clone()),
            ForumError::InvalidRequest(msg) => ForumError::InvalidRequest(msg.clone()),
            ForumError::VoteTimeExpired => ForumError::VoteTimeExpired,
            ForumError::VoteRepeated => ForumError::VoteRepeated,
            ForumError::Timeout => ForumError::Timeout,
            ForumError::RedisError(msg) => ForumError::RedisError(msg.clone()),
            ForumError::DatabaseError(msg) => ForumError::DatabaseError(msg.clone()),
            ForumError::CacheError(msg) => ForumError::CacheError(msg.clone()),
            ForumError::ConfigError(msg) => ForumError::ConfigError(msg.clone()),
            // serde_json errors cannot be cloned
            ForumError::SerializationError(e) => ForumError::Internal(format!("Serialization error: {}", e)),
            ForumError::Internal(msg) => ForumError::Internal(msg.clone()),
        }
    }

    /// Origin failures are fatal to the current operation
    pub fn is_origin_failure(&self) -> bool {
        matches!(self, ForumError::DatabaseError(_) | ForumError::Timeout)
    }

    /// Caller errors that must not be retried
    pub fn is_business_rule_violation(&self) -> bool {
        matches!(self, ForumError::VoteTimeExpired | ForumError::VoteRepeated)
    }

    /// Short label used in logs and metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            ForumError::NotFound(_) => "not_found",
            ForumError::InvalidRequest(_) => "invalid_request",
            ForumError::VoteTimeExpired => "vote_time_expired",
            ForumError::VoteRepeated => "vote_repeated",
            ForumError::Timeout => "timeout",
            ForumError::RedisError(_) => "redis",
            ForumError::DatabaseError(_) => "database",
            ForumError::CacheError(_) => "cache",
            ForumError::ConfigError(_) => "config",
            ForumError::SerializationError(_) => "serialization",
            ForumError::Internal(_) => "internal",
        }
    }

    /// Get HTTP status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            ForumError::InvalidRequest(_) => 400,
            ForumError::VoteTimeExpired => 403,
            ForumError::VoteRepeated => 403,
            ForumError::NotFound(_) => 404,
            ForumError::Timeout => 504,
            ForumError::RedisError(_) => 500,
            ForumError::DatabaseError(_) => 500,
            ForumError::CacheError(_) => 500,
            ForumError::ConfigError(_) => 500,
            ForumError::SerializationError(_) => 500,
            ForumError::Internal(_) => 500,
        }
    }
}

/// Result type alias for forum operations
pub type ForumResult<T> = Result<T, ForumError>;

impl From<tokio_postgres::Error> for ForumError {
    fn from(err: tokio_postgres::Error) -> Self {
        ForumError::DatabaseError(err.to_string())
    }
}

impl From<fred::error::RedisError> for ForumError {
    fn from(err: fred::error::RedisError) -> Self {
        ForumError::RedisError(err.to_string())
    }
}
