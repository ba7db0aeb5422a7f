//! JSON-RPC 2.0 messages, as spoken by language servers over stdio.
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";

pub type RequestId = i64;

/// A request (with an id) or notification (without one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestMessage {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// `workspace/executeCommand` for the given command and arguments.
    pub fn execute_command(id: RequestId, command: &str, arguments: Vec<Value>) -> Self {
        Self::new(
            id,
            "workspace/executeCommand",
            serde_json::json!({
                "command": command,
                "arguments": arguments,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }
}

/// Anything a language server may write to its stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    /// Every response field is optional, so requests must be tried first
    Request(RequestMessage),
    Response(ResponseMessage),
}
