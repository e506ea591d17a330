//! Caller-facing failures of bridge calls.

use std::time::Duration;

use crate::bridge::protocol::{Failure, FailureKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Channel closed or never opened.
    #[error("peer unreachable: channel is closed")]
    Unreachable,

    #[error("`{operation}` timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("peer has no handler for `{operation}`")]
    UnknownHandler { operation: String },

    #[error("`{operation}` rejected its arguments: {message}")]
    InvalidArguments { operation: String, message: String },

    /// The remote handler failed; message carried over from the handler's error.
    #[error("`{operation}` failed: {message}")]
    HandlerThrew {
        operation: String,
        message: String,
        causes: Vec<String>,
    },

    /// Bridge torn down while the call was outstanding.
    #[error("bridge terminated")]
    Terminated,

    #[error("codec error: {0}")]
    Codec(String),
}

impl BridgeError {
    /// Rebuild a caller-facing error from a wire failure.
    pub fn from_failure(operation: &str, failure: Failure) -> Self {
        let operation = operation.to_string();
        match failure.kind {
            FailureKind::UnknownHandler => Self::UnknownHandler { operation },
            FailureKind::InvalidArguments => Self::InvalidArguments {
                operation,
                message: failure.message,
            },
            FailureKind::HandlerThrew => Self::HandlerThrew {
                operation,
                message: failure.message,
                causes: failure.causes,
            },
        }
    }

    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }

    /// Liveness failures: the peer cannot be assumed to be running.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::Unreachable | Self::Timeout { .. } | Self::Terminated)
    }

    /// Message of a remote handler failure, if this is one.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::HandlerThrew { message, .. } | Self::InvalidArguments { message, .. } => {
                Some(message)
            }
            _ => None,
        }
    }
}
