//! Wire envelopes exchanged between the two bridge endpoints.
//!
//! Both directions carry the same envelope set: either side may issue calls
//! and either side may be probed for liveness.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version::VersionInfo;

/// Correlation identifier linking a call to its response.
///
/// UUID v4 keeps ids unique across controller reloads that reuse a named
/// channel, where a stale controller may still be listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of a remote failure, as it crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The receiver has no handler under the requested name.
    UnknownHandler,
    /// The positional arguments did not match the operation's signature.
    InvalidArguments,
    /// The handler returned an error or panicked.
    HandlerThrew,
}

/// Plain description of a handler failure.
///
/// Never a live error object: the cause chain is flattened to strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    pub fn unknown_handler(name: &str) -> Self {
        Self::new(
            FailureKind::UnknownHandler,
            format!("no handler registered for `{name}`"),
        )
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArguments, message)
    }

    pub fn handler_threw(message: impl Into<String>) -> Self {
        Self::new(FailureKind::HandlerThrew, message)
    }

    /// Flatten an error and its source chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: FailureKind::HandlerThrew,
            message: err.to_string(),
            causes: err.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

/// Messages carried by a channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Invoke the named handler on the receiving side.
    Call {
        id: CallId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Exactly one per call: a result when `ok`, a failure otherwise.
    Response {
        id: CallId,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Failure>,
    },

    /// Liveness probe. Answered by the bridge itself, not by a handler.
    Ping { id: CallId },

    Pong { id: CallId, version: VersionInfo },
}

impl Envelope {
    pub fn call(id: CallId, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            id,
            name: name.into(),
            args,
        }
    }

    pub fn success(id: CallId, value: Value) -> Self {
        Self::Response {
            id,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(id: CallId, failure: Failure) -> Self {
        Self::Response {
            id,
            ok: false,
            value: None,
            error: Some(failure),
        }
    }

    pub fn from_outcome(id: CallId, outcome: Result<Value, Failure>) -> Self {
        match outcome {
            Ok(value) => Self::success(id, value),
            Err(failure) => Self::failure(id, failure),
        }
    }

    pub fn id(&self) -> CallId {
        match self {
            Self::Call { id, .. }
            | Self::Response { id, .. }
            | Self::Ping { id }
            | Self::Pong { id, .. } => *id,
        }
    }
}

/// Interpret the `ok`/`value`/`error` triple of a response.
///
/// A failed response without a description still counts as a handler failure.
pub fn response_outcome(
    ok: bool,
    value: Option<Value>,
    error: Option<Failure>,
) -> Result<Value, Failure> {
    if ok {
        Ok(value.unwrap_or(Value::Null))
    } else {
        Err(error.unwrap_or_else(|| {
            Failure::handler_threw("peer reported failure without a description")
        }))
    }
}
