use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

pub type AppResult<T> = Result<T, Error>;

/// how much of a broken upstream body gets carried along for diagnosis
pub const BODY_EXCERPT_CHARS: usize = 500;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    // upstream could not be reached at all, not retried here
    #[error("upstream fetch failed: {0}")]
    FetchFailed(String),

    // upstream answered but not with 2xx/206, status is mirrored back to the caller
    #[error("upstream returned {status}")]
    UpstreamRejected { status: u16 },

    #[error("portal unreachable: {0}")]
    PortalUnreachable(String),

    #[error("portal protocol error: {message}")]
    PortalProtocolError { message: String, excerpt: String },

    #[error("internal server error")]
    InternalServerError,

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    pub fn portal_protocol(message: impl Into<String>, raw_body: &str) -> Self {
        Self::PortalProtocolError {
            message: message.into(),
            excerpt: excerpt(raw_body),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::FetchFailed(_) | Self::PortalUnreachable(_) | Self::PortalProtocolError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::UpstreamRejected { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::InternalServerError | Self::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// first BODY_EXCERPT_CHARS chars, cut on a char boundary
pub fn excerpt(raw_body: &str) -> String {
    raw_body.chars().take(BODY_EXCERPT_CHARS).collect()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!("responding {}: {}", status, self);
        } else {
            debug!("responding {}: {}", status, self);
        }

        let body = match &self {
            Self::PortalProtocolError { excerpt, .. } => json!({
                "error": self.to_string(),
                "excerpt": excerpt,
            }),
            _ => json!({ "error": self.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_is_mirrored() {
        assert_eq!(
            Error::UpstreamRejected { status: 404 }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::UpstreamRejected { status: 503 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_protocol_error_truncates_body() {
        let body = "x".repeat(2_000);
        match Error::portal_protocol("bad json", &body) {
            Error::PortalProtocolError { excerpt, .. } => assert_eq!(excerpt.len(), 500),
            other => panic!("unexpected {other:?}"),
        }
    }
}
