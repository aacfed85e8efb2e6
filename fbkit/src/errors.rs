use axum::response::IntoResponse;
use axum::Json;
use http::StatusCode;
use serde_json::json;

/// JSON error body returned by fbkit handlers and middleware
#[derive(Debug, Clone)]
pub struct ApiError {
    pub detail: String,
    pub status_code: StatusCode,
}

impl ApiError {
    pub fn new<S: ToString>(detail: S, status_code: StatusCode) -> Self {
        Self {
            detail: detail.to_string(),
            status_code,
        }
    }

    /// Internal Server Error (500)
    pub fn internal<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Bad Request (400)
    pub fn bad_request<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::BAD_REQUEST)
    }

    /// Unauthorized (401)
    pub fn unauthorized<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::UNAUTHORIZED)
    }

    /// Bad Gateway (502), used when the remote API fails
    pub fn bad_gateway<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::BAD_GATEWAY)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "detail": self.detail,
        });
        (self.status_code, Json(body)).into_response()
    }
}
