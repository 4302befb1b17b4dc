//! Error taxonomy shared by the dispatcher, the backends and the proxy client
//!
//! Only three kinds of failure are ever visible on the wire; see [`ErrorKind`].

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_METHOD_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoSuchFunction,
    InvalidParams,
    InternalError,
}

impl ErrorKind {
    pub fn code(self) -> i64 {
        match self {
            Self::NoSuchFunction => METHOD_NOT_FOUND,
            Self::InvalidParams => INVALID_METHOD_PARAMS,
            Self::InternalError => INTERNAL_ERROR,
        }
    }

    pub fn canonical_message(self) -> &'static str {
        match self {
            Self::NoSuchFunction => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            METHOD_NOT_FOUND => Some(Self::NoSuchFunction),
            INVALID_METHOD_PARAMS => Some(Self::InvalidParams),
            INTERNAL_ERROR => Some(Self::InternalError),
            _ => None,
        }
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// A dispatch failure already classified into a wire-visible kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("no such function: {0}")]
    NoSuchFunction(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn no_such_function(message: impl Into<String>) -> Self {
        Self::NoSuchFunction(message.into())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchFunction(_) => ErrorKind::NoSuchFunction,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn code(&self) -> i64 {
        self.kind().code()
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NoSuchFunction(message)
            | Self::InvalidParams(message)
            | Self::Internal(message) => message,
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        let message = if self.message().is_empty() {
            self.kind().canonical_message().to_string()
        } else {
            self.message().to_string()
        };

        ErrorObject {
            code: self.code(),
            message,
        }
    }
}

/// Failure raised from inside a registered callable.
///
/// `InvalidParams` lets a callable reject the runtime values of its merged
/// arguments with the same kind the validator uses for structural mismatches.
#[derive(Debug, Error)]
pub enum MethodError {
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
    #[error("result could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl MethodError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<MethodError> for RpcError {
    fn from(err: MethodError) -> Self {
        match err {
            MethodError::InvalidParams(message) => Self::InvalidParams(message),
            MethodError::Failed(message) => {
                tracing::error!(error = %message, "callable failed");
                Self::Internal(message)
            }
            MethodError::Serialize(err) => {
                tracing::error!(error = %err, "could not serialize callable result");
                Self::Internal(format!("could not serialize result: {err}"))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no backend registered for {0} concurrency")]
    Unsupported(&'static str),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("worker failed to start: {0}")]
    Startup(String),
    #[error("control channel error: {0}")]
    Control(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
