/// JSON-RPC 2.0 transport shared by the upstream session and every child server
///
/// Messages are framed as one JSON value per line. The wire structures live
/// here; the connection that correlates calls with responses and dispatches
/// inbound requests lives in `connection`.

pub mod connection;

pub use connection::{Connection, Handler, RejectAll, Request};
pub use jsonrpc_core::{Error as RpcError, ErrorCode, Id};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC protocol version carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Errors returned to the issuer of an outgoing call
///
/// `Closed` is the connection-closed sentinel and signals ordinary shutdown;
/// `Remote` carries a protocol error object sent by the peer.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("connection closed")]
    Closed,

    #[error("call cancelled")]
    Cancelled,

    #[error("remote error: {0}")]
    Remote(RpcError),

    #[error("failed to encode params: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode result: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CallError {
    /// Whether this error only reflects the connection going away
    pub fn is_closed(&self) -> bool {
        matches!(self, CallError::Closed)
    }
}

/// A single JSON-RPC message as it appears on the wire
///
/// Requests, notifications and responses share one shape; `classify` tells
/// them apart by which members are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// What an inbound message turned out to be
#[derive(Debug)]
pub enum Incoming {
    Request {
        id: Id,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Option<Id>,
        outcome: Result<Value, RpcError>,
    },
    Invalid {
        id: Option<Id>,
    },
}

impl Message {
    fn empty(id: Option<Id>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Build a request expecting a response
    pub fn request(id: Id, method: &str, params: Option<Value>) -> Self {
        Self {
            method: Some(method.to_string()),
            params,
            ..Self::empty(Some(id))
        }
    }

    /// Build a one-way notification
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            method: Some(method.to_string()),
            params,
            ..Self::empty(None)
        }
    }

    /// Build a successful response
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::empty(Some(id))
        }
    }

    /// Build an error response
    pub fn failure(id: Id, error: RpcError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(Some(id))
        }
    }

    /// Decide whether this is a request, notification or response
    pub fn classify(self) -> Incoming {
        match (self.method, self.id) {
            (Some(method), Some(id)) => Incoming::Request {
                id,
                method,
                params: self.params,
            },
            (Some(method), None) => Incoming::Notification {
                method,
                params: self.params,
            },
            (None, id) if self.error.is_some() => Incoming::Response {
                id,
                outcome: Err(self.error.unwrap_or_else(RpcError::internal_error)),
            },
            (None, Some(id)) => Incoming::Response {
                id: Some(id),
                // A `"result": null` arrives as `None`
                outcome: Ok(self.result.unwrap_or(Value::Null)),
            },
            (None, None) => Incoming::Invalid { id: None },
        }
    }
}

/// Deserialize request params into a typed value
///
/// Missing params are read as an empty object, so methods whose params are
/// all optional accept an absent `params` member while methods with required
/// fields fail with "invalid params" before their handler runs.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = match params {
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(value) => value,
    };

    serde_json::from_value(value)
        .map_err(|e| RpcError::invalid_params(format!("invalid params: {}", e)))
}

/// "Method not found" error naming the method
pub fn method_not_found(method: &str) -> RpcError {
    RpcError {
        code: ErrorCode::MethodNotFound,
        message: format!("method {:?} not found", method),
        data: None,
    }
}

/// "Internal error" carrying a specific message
pub fn internal_error(message: impl Into<String>) -> RpcError {
    RpcError {
        code: ErrorCode::InternalError,
        message: message.into(),
        data: None,
    }
}

/// "Invalid request" carrying a specific message
pub fn invalid_request(message: impl Into<String>) -> RpcError {
    RpcError {
        code: ErrorCode::InvalidRequest,
        message: message.into(),
        data: None,
    }
}
