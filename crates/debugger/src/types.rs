use std::{
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use server::OutputStream;
use transport::types::{self as dap, SourceBreakpoint, StackFrameId, ThreadId};

pub use transport::types::Variable;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointKind {
    #[default]
    Source,
    Function,
    Address,
}

/// A user breakpoint
///
/// Two breakpoints are the same breakpoint when they share a file and line,
/// whatever their other attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub file_path: PathBuf,
    pub file_name: String,
    pub line: usize,
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: BreakpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_spec: Option<String>,
    /// Whether the adapter accepted it in the current session
    #[serde(skip)]
    pub verified: bool,
}

impl Breakpoint {
    pub fn new(file_path: impl Into<PathBuf>, line: usize) -> Self {
        let file_path = file_path.into();
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            file_path,
            file_name,
            line,
            enabled: true,
            kind: BreakpointKind::Source,
            function_name: None,
            module: None,
            address: None,
            condition: None,
            thread_spec: None,
            verified: false,
        }
    }

    pub fn is_in(&self, file: &Path) -> bool {
        self.file_path == file
    }

    pub(crate) fn to_source_breakpoint(&self) -> SourceBreakpoint {
        SourceBreakpoint {
            line: self.line,
            condition: self.condition.clone().filter(|c| !c.is_empty()),
            hit_condition: None,
        }
    }
}

impl PartialEq for Breakpoint {
    fn eq(&self, other: &Self) -> bool {
        self.file_path == other.file_path && self.line == other.line
    }
}

impl Eq for Breakpoint {}

impl Hash for Breakpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file_path.hash(state);
        self.line.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    /// Adapter frame id used for scope lookups
    pub id: StackFrameId,
    /// 0 is the innermost frame
    pub level: usize,
    pub function: String,
    pub file: Option<PathBuf>,
    pub line: usize,
    pub module: Option<String>,
    pub address: Option<String>,
}

impl StackFrame {
    pub(crate) fn from_dap(level: usize, frame: dap::StackFrame) -> Self {
        let module = frame.module_id.map(|id| match id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        Self {
            id: frame.id,
            level,
            function: frame.name,
            file: frame.source.and_then(|s| s.path),
            line: frame.line,
            module,
            address: frame.instruction_pointer_reference,
        }
    }

    pub fn file_exists(&self) -> bool {
        self.file.as_deref().is_some_and(Path::is_file)
    }
}

/// A debuggee thread; identity is the thread id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Thread {}

impl From<dap::Thread> for Thread {
    fn from(thread: dap::Thread) -> Self {
        Self {
            id: thread.id,
            name: thread.name,
        }
    }
}

/// A line of text from the debuggee, its backend or the adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn new(stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }

    /// Map a DAP output category onto a stream
    pub(crate) fn from_category(category: Option<&str>, text: String) -> Self {
        let stream = match category {
            Some("stdout") => OutputStream::Stdout,
            Some("stderr") => OutputStream::Stderr,
            _ => OutputStream::Normal,
        };
        Self { stream, text }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn breakpoint_identity_is_file_and_line() {
        let mut a = Breakpoint::new("/src/main.c", 10);
        let b = Breakpoint::new("/src/main.c", 10);
        a.condition = Some("x > 1".to_string());
        a.enabled = false;
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);

        assert_ne!(
            Breakpoint::new("/src/main.c", 10),
            Breakpoint::new("/src/main.c", 11)
        );
        assert_ne!(
            Breakpoint::new("/src/main.c", 10),
            Breakpoint::new("/src/other.c", 10)
        );
    }

    #[test]
    fn file_name_is_derived() {
        assert_eq!(Breakpoint::new("/work/app.py", 3).file_name, "app.py");
    }

    #[test]
    fn empty_condition_is_not_sent() {
        let mut bp = Breakpoint::new("/work/app.py", 3);
        bp.condition = Some(String::new());
        assert_eq!(bp.to_source_breakpoint().condition, None);
    }

    #[test]
    fn dap_frame_conversion() {
        let frame: dap::StackFrame = serde_json::from_value(serde_json::json!({
            "id": 1000,
            "name": "main",
            "source": { "path": "/src/main.c" },
            "line": 12,
            "column": 1,
            "moduleId": 7,
            "instructionPointerReference": "0x401136",
        }))
        .unwrap();
        let frame = StackFrame::from_dap(0, frame);
        assert_eq!(frame.function, "main");
        assert_eq!(frame.file.as_deref(), Some(Path::new("/src/main.c")));
        assert_eq!(frame.module.as_deref(), Some("7"));
        assert_eq!(frame.address.as_deref(), Some("0x401136"));
    }

    #[test]
    fn output_categories() {
        assert_eq!(
            OutputLine::from_category(Some("stderr"), "e".into()).stream,
            OutputStream::Stderr
        );
        assert_eq!(
            OutputLine::from_category(Some("console"), "c".into()).stream,
            OutputStream::Normal
        );
    }
}
