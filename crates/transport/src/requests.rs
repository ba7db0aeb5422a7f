//! Requests sent to a debug adapter
use serde::Serialize;
use serde_json::Value;

use crate::message::{Request, Seq};
use crate::types::{Source, SourceBreakpoint, StackFrameId, ThreadId, VariablesReference};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", content = "arguments", rename_all = "camelCase")]
pub enum RequestBody {
    Initialize(Initialize),
    /// Launch arguments are adapter specific, so they are passed through as-is
    Launch(Value),
    Attach(Value),
    SetBreakpoints(SetBreakpoints),
    ConfigurationDone,
    Threads,
    StackTrace(StackTrace),
    Scopes(Scopes),
    Variables(Variables),
    Continue(Continue),
    Next(Next),
    StepIn(StepIn),
    StepOut(StepOut),
    Pause(Pause),
    Disconnect(Disconnect),
    Terminate,
}

impl RequestBody {
    /// Wrap this body in a request envelope with the given sequence number.
    pub fn into_request(self, seq: Seq) -> eyre::Result<Request> {
        let value = serde_json::to_value(&self)
            .map_err(|e| eyre::eyre!("encoding request body: {e}"))?;
        let command = value
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| eyre::eyre!("request body has no command"))?
            .to_string();
        Ok(Request {
            seq,
            command,
            arguments: value.get("arguments").cloned(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Initialize {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub client_name: String,
    #[serde(rename = "adapterID")]
    pub adapter_id: String,
    pub lines_start_at_one: bool,
    pub columns_start_at_one: bool,
    pub path_format: PathFormat,
    pub supports_variable_type: bool,
    pub supports_run_in_terminal_request: bool,
}

impl Initialize {
    pub fn for_adapter(adapter_id: impl Into<String>) -> Self {
        Self {
            client_id: "debugadapter".to_string(),
            client_name: "debugadapter".to_string(),
            adapter_id: adapter_id.into(),
            lines_start_at_one: true,
            columns_start_at_one: true,
            path_format: PathFormat::Path,
            supports_variable_type: true,
            supports_run_in_terminal_request: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PathFormat {
    Path,
    Uri,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpoints {
    pub source: Source,
    pub breakpoints: Vec<SourceBreakpoint>,
    pub source_modified: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    pub thread_id: ThreadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_frame: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scopes {
    pub frame_id: StackFrameId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variables {
    pub variables_reference: VariablesReference,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Continue {
    pub thread_id: ThreadId,
    pub single_thread: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Next {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepIn {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOut {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pause {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnect {
    pub restart: bool,
    pub terminate_debuggee: bool,
}
