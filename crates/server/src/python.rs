//! Python backend
//!
//! Each session runs the target script under `debugpy`, which listens on a
//! freshly allocated port and waits for the debugger to attach.
use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::Sender;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use transport::{ListeningProbe, PortAllocator, PortProbe, PortReservation};

use crate::{
    BridgeEvent, DapEndpoint, DebuggerBackend, ManagedChild, PortRequest, Readiness,
    wait_for_port,
};

pub const KIT: &str = "python";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonSettings {
    /// Interpreter name or path, looked up on `PATH`
    pub interpreter: String,
    pub start_port: u16,
    /// Where debugpy writes its own logs
    pub log_dir: PathBuf,
    /// Longest wait for debugpy to listen before carrying on regardless
    #[serde(with = "crate::millis")]
    pub ready_timeout: Duration,
}

impl Default for PythonSettings {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            start_port: 7000,
            log_dir: std::env::temp_dir().join("debugadapter-debugpy"),
            ready_timeout: Duration::from_millis(800),
        }
    }
}

/// The live debug target and the port it holds
struct Target {
    child: ManagedChild,
    _port: PortReservation,
}

pub struct PythonBridge {
    settings: PythonSettings,
    allocator: PortAllocator,
    events: Sender<BridgeEvent>,
    probe: Arc<dyn PortProbe>,
    process_id: u32,
    target: Option<Target>,
}

impl PythonBridge {
    pub fn new(
        settings: PythonSettings,
        allocator: PortAllocator,
        events: Sender<BridgeEvent>,
    ) -> Self {
        Self {
            settings,
            allocator,
            events,
            probe: Arc::new(ListeningProbe::default()),
            process_id: std::process::id(),
            target: None,
        }
    }

    /// Replace how readiness of the debugpy port is detected.
    pub fn with_probe(mut self, probe: impl PortProbe) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Process id of the live debug target
    pub fn target_pid(&self) -> Option<u32> {
        self.target.as_ref().map(|t| t.child.id())
    }

    fn command(&self, interpreter: &Path, port: u16, script: &Path, args: &[String]) -> Command {
        let mut command = Command::new(interpreter);
        command
            .args(["-m", "debugpy", "--listen"])
            .arg(port.to_string())
            .arg("--wait-for-client")
            .arg("--log-to")
            .arg(&self.settings.log_dir)
            .arg(script)
            .args(args)
            .arg("--pid")
            .arg(self.process_id.to_string());
        command
    }
}

impl DebuggerBackend for PythonBridge {
    fn kit(&self) -> &'static str {
        KIT
    }

    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id))]
    fn request_port(&mut self, request: PortRequest) -> eyre::Result<()> {
        let Some(script) = request.target.as_deref() else {
            eyre::bail!("python debugging needs a script to run");
        };
        if !script.is_file() {
            eyre::bail!("python script {} does not exist", script.display());
        }
        let interpreter = which::which(&self.settings.interpreter).wrap_err_with(|| {
            format!("python interpreter {} not found", self.settings.interpreter)
        })?;

        // at most one debug target at a time
        self.stop();

        if let Err(e) = std::fs::create_dir_all(&self.settings.log_dir) {
            tracing::warn!(error = %e, log_dir = ?self.settings.log_dir, "could not create debugpy log directory");
        }

        let reservation = self.allocator.allocate(self.settings.start_port)?;
        let port = reservation.port();
        let mut command = self.command(&interpreter, port, script, &request.arguments);
        if request.project_path.is_dir() {
            command.current_dir(&request.project_path);
        }

        tracing::info!(%port, script = %script.display(), "starting debugpy");
        let mut child =
            ManagedChild::spawn(&mut command, KIT, &request.session_id, self.events.clone())?;
        let readiness = wait_for_port(
            self.probe.as_ref(),
            port,
            self.settings.ready_timeout,
            &mut child,
        )?;
        if readiness == Readiness::Assumed {
            tracing::debug!(%port, "debugpy readiness assumed");
        }

        self.target = Some(Target {
            child,
            _port: reservation,
        });
        let _ = self.events.send(BridgeEvent::Ready(DapEndpoint {
            session_id: request.session_id,
            kit: KIT.to_string(),
            port,
            project_path: request.project_path,
            java: None,
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut target) = self.target.take() {
            tracing::debug!(pid = %target.child.id(), "closing previous python target");
            target.child.terminate();
        }
    }
}
