//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "code": self.status.as_u16()
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<blabber_core::Error> for ApiError {
    fn from(err: blabber_core::Error) -> Self {
        use blabber_core::Error;
        match &err {
            Error::InvalidRequest(_) => ApiError::bad_request(err.to_string()),
            Error::AlreadyAttached | Error::ClosedAccessor => ApiError::conflict(err.to_string()),
            Error::Synthesis { .. } | Error::Http(_) => ApiError::bad_gateway(err.to_string()),
            Error::PoolShutdown => ApiError::unavailable(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let err: ApiError = blabber_core::Error::InvalidRequest("too long".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("too long"));

        let err: ApiError = blabber_core::Error::AlreadyAttached.into();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err: ApiError = blabber_core::Error::PoolShutdown.into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError = blabber_core::Error::Synthesis {
            status: 403,
            message: "forbidden".to_string(),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);

        let err: ApiError = blabber_core::Error::Decode("bad".to_string()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
