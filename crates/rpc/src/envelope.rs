//! JSON-RPC 2.0 envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Standard error code: malformed JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Standard error code: not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// Standard error code: unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Standard error code: bad params.
pub const INVALID_PARAMS: i64 = -32602;
/// Standard error code: internal error.
pub const INTERNAL_ERROR: i64 = -32603;

/// A request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: &str, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// The effective parameter value. By-position calls with a single
    /// element unwrap to that element, so `Gate.Submit` accepts both
    /// `params: {batch}` and `params: [{batch}]`.
    pub fn single_param(&self) -> Value {
        match &self.params {
            Value::Array(items) if items.len() == 1 => items[0].clone(),
            other => other.clone(),
        }
    }
}

/// A typed error object. `code` and `message` are part of the public
/// contract; `data` is free-form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// A response object: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Value,
}

impl RpcResponse {
    pub fn result(result: Value, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(error: RpcError, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_param_unwraps_positional() {
        let req = RpcRequest::new("Gate.Ping", json!(["hello"]), json!(1));
        assert_eq!(req.single_param(), json!("hello"));

        let req = RpcRequest::new("Gate.Ping", json!({"a": 1}), json!(1));
        assert_eq!(req.single_param(), json!({"a": 1}));
    }

    #[test]
    fn response_shape() {
        let ok = RpcResponse::result(json!(3), json!(7));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"result\":3"));
        assert!(!text.contains("error"));

        let err = RpcResponse::error(RpcError::method_not_found("Nope.Nope"), json!(7));
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("-32601"));
        assert!(!text.contains("result"));
    }
}
