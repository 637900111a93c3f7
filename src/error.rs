use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Error taxonomy shared by every handler. Serialized as
/// `{"detail": ..., "code": ...}` so the frontend keeps a stable contract.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("You have already reacted to this target")]
    AlreadyReacted,

    #[error("Duplicate reaction detected and cleaned up, please retry once")]
    DuplicateCleaned,

    #[error("Comment has already been deleted")]
    AlreadyDeleted,

    #[error("No reaction found for this target")]
    ReactionNotFound,

    #[error("Maximum reply depth reached")]
    DepthLimitExceeded,

    #[error("Parent comment is not active")]
    ParentInactive,

    #[error("Target does not accept reactions in its current state")]
    TargetUnavailable,

    #[error("Storage is under contention, please retry")]
    Transient,

    #[error("Internal server error")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::ReactionNotFound => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::AlreadyReacted | Self::DuplicateCleaned | Self::AlreadyDeleted => {
                StatusCode::CONFLICT
            }
            Self::DepthLimitExceeded | Self::ParentInactive | Self::TargetUnavailable => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Transient => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Unauthorized(_) => "unauthorized",
            Self::AlreadyReacted => "already_reacted",
            Self::DuplicateCleaned => "duplicate_cleaned",
            Self::AlreadyDeleted => "already_deleted",
            Self::ReactionNotFound => "reaction_not_found",
            Self::DepthLimitExceeded => "depth_limit_exceeded",
            Self::ParentInactive => "parent_inactive",
            Self::TargetUnavailable => "target_unavailable",
            Self::Transient => "transient",
            Self::Database(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Database(ref error) = self {
            tracing::error!("database error: {}", error);
        }

        let body = Json(serde_json::json!({
            "detail": self.to_string(),
            "code": self.code(),
        }));

        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("missing".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::AlreadyReacted.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::DuplicateCleaned.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::DepthLimitExceeded.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::Transient.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_stable_codes() {
        assert_eq!(ApiError::AlreadyReacted.code(), "already_reacted");
        assert_eq!(ApiError::ReactionNotFound.code(), "reaction_not_found");
        assert_eq!(ApiError::ParentInactive.code(), "parent_inactive");
    }
}
