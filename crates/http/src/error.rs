use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tarry_broker::BrokerError;

/// Error half of every JSON response: `{"result": false, "error": ...}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub result: bool,
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let status = match &err {
            BrokerError::UnknownClient(_) => StatusCode::NOT_FOUND,
            BrokerError::ReservationExpired { .. } => StatusCode::GONE,
            BrokerError::MissingPayload(_) => {
                tracing::error!(%err, "internal inconsistency reached the transport");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                result: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn broker_errors_map_to_status_codes() {
        let unknown = ApiError::from(BrokerError::UnknownClient("c".into()));
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
        assert!(unknown.message.contains("unknown client c"));

        let expired = ApiError::from(BrokerError::ReservationExpired {
            client: "c".into(),
            message_id: Uuid::nil(),
        });
        assert_eq!(expired.status, StatusCode::GONE);

        let missing = ApiError::from(BrokerError::MissingPayload(Uuid::nil()));
        assert_eq!(missing.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_body_shape() {
        let body = serde_json::to_value(ErrorBody {
            result: false,
            error: "endpoint not found".into(),
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"result": false, "error": "endpoint not found"})
        );
    }
}
