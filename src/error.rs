//! Error types for MCP protocol operations

use thiserror::Error;

use crate::protocol::{error_codes, ErrorObject, RequestId};

/// MCP protocol error type
#[derive(Error, Debug)]
pub enum Error {
    /// An error returned by the remote peer, or destined for it.
    #[error("{message}")]
    Protocol {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A locally detected timeout. The peer is informed via
    /// `notifications/cancelled`.
    #[error("Request timed out after {0} ms")]
    RequestTimeout(u128),

    /// The caller cancelled the request; carries the caller's reason verbatim.
    #[error("{0}")]
    Cancelled(String),

    /// A capability precondition failed locally, before any frame was sent.
    #[error("{0}")]
    Capability(String),

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Create a protocol error with an explicit JSON-RPC error code.
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create an invalid-params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Error::InvalidParams {
            message: message.into(),
        }
    }

    /// The JSON-RPC error code this error maps to at the wire boundary.
    pub fn code(&self) -> i32 {
        match self {
            Error::Protocol { code, .. } => *code,
            Error::Serialization(_) => error_codes::PARSE_ERROR,
            Error::InvalidParams { .. } | Error::Validation(_) => error_codes::INVALID_PARAMS,
            Error::MethodNotFound { .. } => error_codes::METHOD_NOT_FOUND,
            Error::Capability(_) => error_codes::INVALID_REQUEST,
            Error::RequestTimeout(_) => error_codes::REQUEST_TIMEOUT,
            Error::ConnectionClosed(_) => error_codes::CONNECTION_CLOSED,
            Error::Transport(_) | Error::Cancelled(_) | Error::Internal(_) => {
                error_codes::INTERNAL_ERROR
            }
        }
    }

    /// Convert into the wire error object sent back to the peer.
    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            Error::Protocol { data, .. } => data.clone(),
            _ => None,
        };
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }

    /// Reconstruct an error from a wire error object received for `id`.
    pub fn from_error_object(error: ErrorObject, _id: &RequestId) -> Self {
        Error::Protocol {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Convenience result type for MCP operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            Error::invalid_params("bad").code(),
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            Error::MethodNotFound {
                method: "tools/list".into()
            }
            .code(),
            error_codes::METHOD_NOT_FOUND
        );
        assert_eq!(Error::RequestTimeout(0).code(), error_codes::REQUEST_TIMEOUT);
        assert_eq!(
            Error::ConnectionClosed("closed".into()).code(),
            error_codes::CONNECTION_CLOSED
        );
        assert_eq!(
            Error::protocol(error_codes::PARSE_ERROR, "unparseable").code(),
            error_codes::PARSE_ERROR
        );
    }

    #[test]
    fn test_cancelled_reason_is_verbatim() {
        let err = Error::Cancelled("Cancelled by test".into());
        assert_eq!(err.to_string(), "Cancelled by test");
    }

    #[test]
    fn test_wire_round_trip_preserves_code() {
        let obj = Error::invalid_params("missing field").to_error_object();
        let back = Error::from_error_object(obj, &RequestId::Number(1));
        assert_eq!(back.code(), error_codes::INVALID_PARAMS);
    }
}
