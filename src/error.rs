//! Error taxonomy shared by the cache-aware lookups, the batcher and the server.

use thiserror::Error;

/// Message sent to clients rejected by admission control.
pub const RATE_LIMIT_MESSAGE: &str = "Too many requests, please try again later.";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or out-of-range input. The whole request is rejected.
    #[error("{0}")]
    Validation(String),

    /// Admission control rejected the client for the rest of the window.
    #[error("Too many requests, please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    /// Transport failure or non-success status from an upstream service.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream answered with a shape that breaks its contract.
    #[error("Unexpected upstream response: {0}")]
    UpstreamFormat(String),
}

impl GatewayError {
    /// Whether another attempt may succeed. Contract mismatches are not retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::UpstreamTimeout | GatewayError::Upstream(_))
    }
}

#[cfg(feature = "http")]
mod response {
    use super::GatewayError;
    use axum::http::{header, HeaderValue, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::Json;

    impl GatewayError {
        pub fn status(&self) -> StatusCode {
            match self {
                GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
                GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
                GatewayError::Upstream(_) | GatewayError::UpstreamFormat(_) => StatusCode::BAD_GATEWAY,
            }
        }
    }

    impl IntoResponse for GatewayError {
        fn into_response(self) -> Response {
            let status = self.status();
            let body = Json(serde_json::json!({ "error": self.to_string() }));
            let mut response = (status, body).into_response();
            if let GatewayError::RateLimited { retry_after_secs } = self {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            }
            response
        }
    }
}
