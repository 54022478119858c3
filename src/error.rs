use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Failures surfaced by the fan-out core.
///
/// Push, presence and typing relay failures never show up here; they are
/// logged where they happen and swallowed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("user {user_id} is not a participant of {conversation}")]
    Unauthorized { user_id: i64, conversation: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("session table full ({capacity} live sessions)")]
    ResourceExhausted { capacity: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ChatError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Stable identifier sent to clients in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound { .. } => "not_found",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<time::error::ComponentRange> for ChatError {
    fn from(err: time::error::ComponentRange) -> Self {
        Self::StorageUnavailable(format!("corrupt timestamp: {err}"))
    }
}
