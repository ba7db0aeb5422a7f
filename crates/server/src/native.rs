//! Native (C/C++) backend
//!
//! Native projects are debugged through a gdb-backed adapter listening on a
//! fixed port. The bridge answers port requests with that port, optionally
//! starting the adapter itself when a command is configured.
use std::{path::Path, process::Command, sync::Arc, time::Duration};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use transport::{ListeningProbe, PortProbe};

use crate::{BridgeEvent, DapEndpoint, DebuggerBackend, ManagedChild, PortRequest, wait_for_port};

pub const KIT: &str = "native";

/// Placeholder replaced by the adapter port in `adapter_command`
pub const PORT_PLACEHOLDER: &str = "{port}";

/// gdb used when neither the target nor the settings name one
pub const DEFAULT_DEBUGGER_PATH: &str = "/usr/bin/gdb";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSettings {
    pub adapter_port: u16,
    /// Command line starting the adapter; unset when it is started externally
    pub adapter_command: Option<Vec<String>>,
    pub debugger_path: String,
    /// Upper bound on waiting for a spawned adapter to listen
    #[serde(with = "crate::millis")]
    pub ready_timeout: Duration,
}

impl Default for NativeSettings {
    fn default() -> Self {
        Self {
            adapter_port: 4711,
            adapter_command: None,
            debugger_path: DEFAULT_DEBUGGER_PATH.to_string(),
            ready_timeout: Duration::from_secs(3),
        }
    }
}

pub struct NativeBridge {
    settings: NativeSettings,
    events: Sender<BridgeEvent>,
    probe: Arc<dyn PortProbe>,
    adapter: Option<ManagedChild>,
}

impl NativeBridge {
    pub fn new(settings: NativeSettings, events: Sender<BridgeEvent>) -> Self {
        Self {
            settings,
            events,
            probe: Arc::new(ListeningProbe::default()),
            adapter: None,
        }
    }

    pub fn with_probe(mut self, probe: impl PortProbe) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    fn adapter_command(&self) -> Option<Command> {
        let argv = self.settings.adapter_command.as_ref()?;
        let port = self.settings.adapter_port.to_string();
        let mut argv = argv.iter().map(|arg| arg.replace(PORT_PLACEHOLDER, &port));
        let mut command = Command::new(argv.next()?);
        command.args(argv);
        Some(command)
    }

    fn ensure_adapter(&mut self, session_id: &str) -> eyre::Result<()> {
        if let Some(adapter) = self.adapter.as_mut() {
            if adapter.is_running() {
                adapter.set_session(session_id);
                return Ok(());
            }
        }
        let Some(mut command) = self.adapter_command() else {
            return Ok(());
        };

        tracing::info!(port = %self.settings.adapter_port, "starting native debug adapter");
        let mut adapter = ManagedChild::spawn(&mut command, KIT, session_id, self.events.clone())?;
        wait_for_port(
            self.probe.as_ref(),
            self.settings.adapter_port,
            self.settings.ready_timeout,
            &mut adapter,
        )?;
        self.adapter = Some(adapter);
        Ok(())
    }
}

impl DebuggerBackend for NativeBridge {
    fn kit(&self) -> &'static str {
        KIT
    }

    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id))]
    fn request_port(&mut self, request: PortRequest) -> eyre::Result<()> {
        self.ensure_adapter(&request.session_id)?;
        let endpoint = DapEndpoint {
            session_id: request.session_id,
            kit: KIT.to_string(),
            port: self.settings.adapter_port,
            project_path: request.project_path,
            java: None,
        };
        let _ = self.events.send(BridgeEvent::Ready(endpoint));
        Ok(())
    }

    fn stop(&mut self) {
        // the adapter serves every native session, so it outlives them
    }
}

impl Drop for NativeBridge {
    fn drop(&mut self) {
        if let Some(mut adapter) = self.adapter.take() {
            adapter.terminate();
        }
    }
}

/// Arguments of the `launch` request for a native executable, or for a
/// post-mortem session over `core_dump`
pub fn launch_request(
    program: &Path,
    args: &[String],
    cwd: &Path,
    debugger_path: &str,
    core_dump: Option<&Path>,
) -> Value {
    let mut request = serde_json::json!({
        "name": "(gdb) Launch",
        "type": "cppdbg",
        "request": "launch",
        "program": program,
        "args": args,
        "cwd": cwd,
        "stopAtEntry": false,
        "environment": [],
        "externalConsole": false,
        "MIMode": "gdb",
        "miDebuggerPath": debugger_path,
    });
    if let Some(core) = core_dump {
        request["coreDumpPath"] = serde_json::json!(core);
    }
    request
}
