//! The project a session debugs
//!
//! Build systems and language plugins live outside this crate; the session
//! only talks to them through [`ProjectContext`].
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;
use server::{DapEndpoint, JavaToolchain, PortRequest, native};
use transport::requests::RequestBody;

pub trait ProjectContext: Send {
    /// Build kit or language name used to pick a backend
    fn kit_name(&self) -> String;

    fn is_need_build(&self) -> bool {
        false
    }

    fn is_target_ready(&self) -> bool {
        true
    }

    /// Start a build. Its outcome is reported with
    /// [`Debugger::on_build_finished`](crate::Debugger::on_build_finished).
    fn request_build(&mut self) -> eyre::Result<()> {
        eyre::bail!("project {} cannot be built", self.kit_name())
    }

    /// What to ask the backend for when starting session `session_id`
    fn port_request(&self, session_id: &str) -> eyre::Result<PortRequest>;

    /// The `launch` or `attach` request to send once `endpoint` is ready
    fn session_request(&self, endpoint: &DapEndpoint) -> eyre::Result<RequestBody>;
}

/// A project described entirely by its launch parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugTarget {
    pub kit: String,
    pub project_path: PathBuf,
    /// Executable, script or Java trigger file
    pub program: Option<PathBuf>,
    pub arguments: Vec<String>,
    /// gdb used by the native adapter
    pub debugger_path: Option<String>,
    /// Core file inspected instead of running `program`
    pub core_dump: Option<PathBuf>,
    pub java: Option<JavaToolchain>,
}

impl DebugTarget {
    fn program(&self) -> eyre::Result<&PathBuf> {
        self.program
            .as_ref()
            .ok_or_else(|| eyre::eyre!("no program configured for {} target", self.kit))
    }
}

impl ProjectContext for DebugTarget {
    fn kit_name(&self) -> String {
        self.kit.clone()
    }

    fn port_request(&self, session_id: &str) -> eyre::Result<PortRequest> {
        let arguments = match &self.core_dump {
            Some(core) => vec![core.display().to_string()],
            None => self.arguments.clone(),
        };
        Ok(PortRequest {
            session_id: session_id.to_string(),
            project_path: self.project_path.clone(),
            target: self.program.clone(),
            arguments,
            java: self.java.clone(),
        })
    }

    fn session_request(&self, endpoint: &DapEndpoint) -> eyre::Result<RequestBody> {
        match endpoint.kit.as_str() {
            native::KIT => Ok(RequestBody::Launch(native::launch_request(
                self.program()?,
                &self.arguments,
                &self.project_path,
                self.debugger_path
                    .as_deref()
                    .unwrap_or(native::DEFAULT_DEBUGGER_PATH),
                self.core_dump.as_deref(),
            ))),
            server::python::KIT => Ok(RequestBody::Attach(json!({
                "name": "Python: attach",
                "type": "python",
                "request": "attach",
                "connect": { "host": "127.0.0.1", "port": endpoint.port },
                "justMyCode": false,
                "pathMappings": [{
                    "localRoot": endpoint.project_path,
                    "remoteRoot": endpoint.project_path,
                }],
            }))),
            server::java::KIT => {
                let target = endpoint
                    .java
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("java endpoint without a run target"))?;
                eyre::ensure!(
                    !target.main_class.is_empty(),
                    "no main class found in {}",
                    target.workspace.display()
                );
                Ok(RequestBody::Launch(json!({
                    "name": "Java: launch",
                    "type": "java",
                    "request": "launch",
                    "mainClass": target.main_class,
                    "projectName": target.project_name,
                    "classPaths": target.class_paths,
                    "cwd": target.workspace,
                    "args": self.arguments.join(" "),
                    "console": "internalConsole",
                })))
            }
            other => eyre::bail!("no launch configuration for kit {other}"),
        }
    }
}
