//! HTTP error types for the `stateseal` proxy.
//!
//! Maps transform and backend failures into HTTP responses. The body is the
//! error text as `text/plain`, which Terraform prints verbatim.

use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use stateseal_core::TransformError;

use crate::backend::BackendError;

/// Error returned from the proxy handler.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The client used a verb the proxy does not forward.
    #[error("Method Not Allowed")]
    MethodNotAllowed,

    /// The request body could not be read, usually because it exceeds the
    /// configured limit.
    #[error("{}", .0.body_text())]
    Body(#[from] BytesRejection),

    /// The request body could not be encrypted.
    #[error("{0}")]
    Encrypt(#[from] TransformError),

    /// The backend could not be reached.
    #[error("{0}")]
    Backend(#[from] BackendError),
}

impl ProxyError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Body(rejection) => rejection.status(),
            Self::Encrypt(e) if e.is_input_error() => StatusCode::BAD_REQUEST,
            Self::Encrypt(_) | Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ProxyError::MethodNotAllowed.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            ProxyError::Encrypt(TransformError::AlreadyEncrypted).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Encrypt(TransformError::EmptyInput).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Encrypt(TransformError::KeyUnwrap { attempts: vec![] }).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn body_is_error_text() {
        assert_eq!(ProxyError::MethodNotAllowed.to_string(), "Method Not Allowed");
        assert_eq!(
            ProxyError::Encrypt(TransformError::AlreadyEncrypted).to_string(),
            "input is already encrypted"
        );
    }
}
