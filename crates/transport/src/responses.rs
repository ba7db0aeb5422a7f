//! Typed bodies of responses from a debug adapter
//!
//! Decode with [`crate::message::Response::body_as`].
use serde::Deserialize;

use crate::types::{self, Scope, StackFrame, Thread, Variable};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub supports_configuration_done_request: Option<bool>,
    #[serde(default)]
    pub supports_conditional_breakpoints: Option<bool>,
    #[serde(default)]
    pub supports_terminate_request: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsResponse {
    pub breakpoints: Vec<types::Breakpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsResponse {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponse {
    pub stack_frames: Vec<StackFrame>,
    #[serde(default)]
    pub total_frames: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesResponse {
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesResponse {
    pub variables: Vec<Variable>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;

    #[test]
    fn stack_trace_body() {
        let response: Response = serde_json::from_str(
            r#"{
                "seq": 9, "request_seq": 8, "success": true, "command": "stackTrace",
                "body": {
                    "stackFrames": [
                        {"id": 1, "name": "main", "line": 12, "column": 1,
                         "source": {"path": "/src/main.c"}}
                    ],
                    "totalFrames": 1
                }
            }"#,
        )
        .unwrap();

        let body: StackTraceResponse = response.body_as().unwrap();
        assert_eq!(body.stack_frames.len(), 1);
        assert_eq!(body.stack_frames[0].name, "main");
        assert_eq!(body.total_frames, Some(1));
    }

    #[test]
    fn variables_with_type_field() {
        let response: Response = serde_json::from_str(
            r#"{
                "seq": 3, "request_seq": 2, "success": true, "command": "variables",
                "body": {"variables": [{"name": "x", "value": "1", "type": "int", "variablesReference": 0}]}
            }"#,
        )
        .unwrap();

        let body: VariablesResponse = response.body_as().unwrap();
        assert_eq!(body.variables[0].r#type.as_deref(), Some("int"));
    }
}
