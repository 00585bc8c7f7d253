use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_engine::{EngineError, RestoreError};
use serde_json::json;

/// Process exit codes shared by every command.
pub mod exit {
    pub const OK: i32 = 0;
    pub const WARNING: i32 = 1;
    pub const CRITICAL: i32 = 2;
    pub const USAGE: i32 = 3;
}

/// Configuration and usage mistakes exit 3; everything else is a failed
/// operation.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    let config_error = error.chain().any(|cause| {
        matches!(cause.downcast_ref::<EngineError>(), Some(EngineError::Config(_) | EngineError::UnknownTier(_)))
            || matches!(
                cause.downcast_ref::<RestoreError>(),
                Some(RestoreError::UnknownScope(_) | RestoreError::Engine(EngineError::Config(_)))
            )
    });
    if config_error {
        exit::USAGE
    } else {
        exit::CRITICAL
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_usage_errors() {
        let err = anyhow::Error::new(EngineError::Config("duplicate tier `critical`".into()));
        assert_eq!(exit_code_for(&err), exit::USAGE);

        let err = anyhow::Error::new(RestoreError::UnknownScope("traces".into()));
        assert_eq!(exit_code_for(&err), exit::USAGE);

        let err = anyhow::Error::new(RestoreError::Aborted);
        assert_eq!(exit_code_for(&err), exit::CRITICAL);
    }
}
