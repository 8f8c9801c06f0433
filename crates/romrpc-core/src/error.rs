//! Error types for the RPC substrate.
//!
//! Every failure a caller can observe is one of the variants below. Errors that
//! cross the wire are carried as a [`ResponseError`] with a machine-readable
//! `code` and an optional `type` tag so client code can branch without parsing
//! message strings.

use crate::protocol::ResponseError;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes used by this crate.
///
/// Standard JSON-RPC codes:
/// - -32700: Parse error
/// - -32600: Invalid Request
/// - -32601: Method not found
/// - -32602: Invalid params
/// - -32603: Internal error
///
/// Application codes (-32000 to -32099):
/// - -32000: Transport/connectivity error
/// - -32001: No object found for reference
/// - -32002: Method not found on a live object
/// - -32003: Invalid or expired session
/// - -32004: Operation rolled back inside a transaction
/// - -32005: Request aborted (session closed or reconnect failed)
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const TRANSPORT_ERROR: i32 = -32000;
    pub const OBJECT_NOT_FOUND: i32 = -32001;
    pub const OBJECT_METHOD_NOT_FOUND: i32 = -32002;
    pub const INVALID_SESSION: i32 = -32003;
    pub const ROLLBACK: i32 = -32004;
    pub const ABORTED: i32 = -32005;
}

/// Type tags attached to wire errors.
pub mod types {
    pub const PROTOCOL: &str = "PROTOCOL_ERROR";
    pub const OBJECT_NOT_FOUND: &str = "OBJECT_NOT_FOUND";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const INVOCATION_FAILED: &str = "INVOCATION_FAILED";
    pub const ROLLBACK: &str = "TRANSACTION_ROLLBACK";
}

/// Main error type for the crate.
#[derive(Debug, Error)]
pub enum RomError {
    /// Malformed message: missing required field, unknown method, bad shape.
    /// Never retried.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A failure reported by the remote side for a well-formed request.
    #[error("Server error {code}: {message}")]
    ServerObject {
        code: i32,
        message: String,
        error_type: Option<String>,
        data: Option<Value>,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    /// A pending request was cancelled by a session close or disconnect.
    #[error("Request aborted: {reason}")]
    Aborted { reason: String },

    #[error("Transaction rolled back: {message}")]
    Rollback { message: String },

    #[error("Session closed")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    /// Programming error: two in-flight requests share an id.
    #[error("Request id {0} already has a pending slot")]
    DuplicateRequestId(u64),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RomError>;

impl From<std::io::Error> for RomError {
    fn from(err: std::io::Error) -> Self {
        RomError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RomError {
    fn from(err: serde_json::Error) -> Self {
        RomError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for RomError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RomError::Timeout(Duration::from_secs(0))
        } else {
            RomError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl RomError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RomError::Protocol {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        RomError::Transport {
            message: message.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        RomError::Aborted {
            reason: reason.into(),
        }
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        RomError::Rollback {
            message: message.into(),
        }
    }

    /// The local failure raised when a reference is unknown or already released.
    pub fn object_not_found(object_ref: &str) -> Self {
        RomError::ServerObject {
            code: codes::OBJECT_NOT_FOUND,
            message: format!("no object found: {}", object_ref),
            error_type: Some(types::OBJECT_NOT_FOUND.to_string()),
            data: None,
        }
    }

    /// An RPC method the server does not dispatch. Reconstructed as
    /// [`RomError::Protocol`] on the client side.
    pub fn unknown_method(method: &str) -> Self {
        RomError::ServerObject {
            code: codes::METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            error_type: Some(types::PROTOCOL.to_string()),
            data: None,
        }
    }

    pub fn method_not_found(type_name: &str, method: &str) -> Self {
        RomError::ServerObject {
            code: codes::OBJECT_METHOD_NOT_FOUND,
            message: format!("method not found: {}.{}", type_name, method),
            error_type: Some(types::METHOD_NOT_FOUND.to_string()),
            data: None,
        }
    }

    pub fn event_not_found(type_name: &str, event: &str) -> Self {
        RomError::ServerObject {
            code: codes::OBJECT_METHOD_NOT_FOUND,
            message: format!("event not found: {}.{}", type_name, event),
            error_type: Some(types::METHOD_NOT_FOUND.to_string()),
            data: None,
        }
    }

    /// Wrap a failure raised by a constructor or method body. Structured
    /// server errors pass through; anything else becomes an
    /// `INVOCATION_FAILED` error with the original message kept in `data`.
    pub fn invocation_failed(context: &str, err: RomError) -> Self {
        match err {
            RomError::ServerObject { .. } | RomError::Protocol { .. } => err,
            other => RomError::ServerObject {
                code: codes::INTERNAL_ERROR,
                message: format!("{} failed", context),
                error_type: Some(types::INVOCATION_FAILED.to_string()),
                data: Some(Value::String(other.to_string())),
            },
        }
    }

    /// Convert to a JSON-RPC error code.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RomError::Protocol { .. } => codes::INVALID_PARAMS,
            RomError::Json { .. } => codes::PARSE_ERROR,
            RomError::ServerObject { code, .. } => *code,
            RomError::Transport { .. }
            | RomError::Timeout(_)
            | RomError::NotConnected
            | RomError::Io { .. } => codes::TRANSPORT_ERROR,
            RomError::Rollback { .. } => codes::ROLLBACK,
            RomError::Aborted { .. } | RomError::Closed => codes::ABORTED,
            RomError::DuplicateRequestId(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Machine-readable type tag for the wire.
    pub fn type_tag(&self) -> Option<&str> {
        match self {
            RomError::Protocol { .. } => Some(types::PROTOCOL),
            RomError::ServerObject { error_type, .. } => error_type.as_deref(),
            RomError::Rollback { .. } => Some(types::ROLLBACK),
            _ => None,
        }
    }

    /// Build the wire error for this failure. The rendered message of the
    /// original failure is kept in `data` for diagnostics.
    pub fn to_response_error(&self) -> ResponseError {
        let data = match self {
            RomError::ServerObject { data, .. } => data.clone(),
            other => Some(Value::String(other.to_string())),
        };
        let message = match self {
            RomError::ServerObject { message, .. } => message.clone(),
            RomError::Protocol { message } => message.clone(),
            other => other.to_string(),
        };
        ResponseError {
            code: self.to_rpc_error_code(),
            message,
            data,
            error_type: self.type_tag().map(String::from),
        }
    }

    /// Reconstruct a typed error from a wire error.
    pub fn from_response_error(err: ResponseError) -> Self {
        match err.code {
            codes::PARSE_ERROR
            | codes::INVALID_REQUEST
            | codes::INVALID_PARAMS
            | codes::METHOD_NOT_FOUND
                if err.error_type.as_deref() == Some(types::PROTOCOL) =>
            {
                RomError::Protocol {
                    message: err.message,
                }
            }
            codes::ROLLBACK => RomError::Rollback {
                message: err.message,
            },
            _ => RomError::ServerObject {
                code: err.code,
                message: err.message,
                error_type: err.error_type,
                data: err.data,
            },
        }
    }

    /// Whether a connection attempt that failed with this error may be retried.
    ///
    /// Individual requests are never re-sent automatically; this only drives
    /// the connection-level retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RomError::Transport { .. } | RomError::Timeout(_) | RomError::Io { .. }
        )
    }

    /// Whether this is the "unknown reference" failure.
    pub fn is_object_not_found(&self) -> bool {
        matches!(self, RomError::ServerObject { code, .. } if *code == codes::OBJECT_NOT_FOUND)
    }
}

impl Clone for RomError {
    fn clone(&self) -> Self {
        match self {
            RomError::Protocol { message } => RomError::Protocol {
                message: message.clone(),
            },
            RomError::ServerObject {
                code,
                message,
                error_type,
                data,
            } => RomError::ServerObject {
                code: *code,
                message: message.clone(),
                error_type: error_type.clone(),
                data: data.clone(),
            },
            RomError::Transport { message } => RomError::Transport {
                message: message.clone(),
            },
            RomError::Timeout(d) => RomError::Timeout(*d),
            RomError::Aborted { reason } => RomError::Aborted {
                reason: reason.clone(),
            },
            RomError::Rollback { message } => RomError::Rollback {
                message: message.clone(),
            },
            RomError::Closed => RomError::Closed,
            RomError::NotConnected => RomError::NotConnected,
            RomError::DuplicateRequestId(id) => RomError::DuplicateRequestId(*id),
            // Sources are not cloneable; keep the rendered message.
            RomError::Io { message, .. } => RomError::Io {
                message: message.clone(),
                source: None,
            },
            RomError::Json { message, .. } => RomError::Json {
                message: message.clone(),
                source: None,
            },
        }
    }
}
