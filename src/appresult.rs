use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;

use crate::ChatError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::Unauthorized { .. }) => StatusCode::FORBIDDEN,
            Some(ChatError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(ChatError::StorageUnavailable(_)) | Some(ChatError::ResourceExhausted { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Some(ChatError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let kind = self.0.downcast_ref::<ChatError>().map_or("internal", ChatError::kind);
        (
            status,
            Json(json!({ "kind": kind, "message": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_errors_map_to_statuses() {
        let forbidden = AppError::from(ChatError::Unauthorized { user_id: 1, conversation: "g:1".into() });
        assert_eq!(forbidden.into_response().status(), StatusCode::FORBIDDEN);

        let missing = AppError::from(ChatError::not_found("group", 9));
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let other = AppError::from(anyhow::anyhow!("boom"));
        assert_eq!(other.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
