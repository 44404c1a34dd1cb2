use api_shared::ErrorRes;
use axum::extract::rejection::{BytesRejection, JsonRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pvfll_core::{BoxError, TypesError};

/// Error returned by every handler, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<BoxError> for ApiError {
    fn from(e: BoxError) -> Self {
        let status = match &e {
            BoxError::InvalidInput(_) | BoxError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            BoxError::Occupied { .. } => StatusCode::CONFLICT,
            BoxError::NotFound(_) => StatusCode::NOT_FOUND,
            BoxError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BoxError::SigningUnsupported => StatusCode::NOT_IMPLEMENTED,
            _ => {
                tracing::error!(error = %e, "request failed");
                return Self::internal("Internal error");
            }
        };

        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<TypesError> for ApiError {
    fn from(e: TypesError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorRes {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pvfll_core::BoxNumber;

    #[test]
    fn box_errors_map_to_statuses() {
        let occupied = BoxError::Occupied {
            box_number: BoxNumber::new(1).unwrap(),
            name: "a".into(),
        };
        assert_eq!(ApiError::from(occupied).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(BoxError::NotFound("box1/a".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(BoxError::TooLarge { size: 2, max: 1 }).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from(BoxError::SigningUnsupported).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ApiError::from(TypesError::InvalidBoxNumber("9".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = ApiError::from(BoxError::Notify("pusher said 401 with secret xyz".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal error");
    }
}
