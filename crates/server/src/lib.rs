//! Backend bridges
//!
//! Each supported language has a bridge that prepares a debug adapter the
//! session can connect to: the Java bridge drives a language server, the
//! Python bridge spawns the target under `debugpy` and the native bridge
//! points at a gdb-backed adapter. Bridges report back through
//! [`BridgeEvent`]s on a channel instead of blocking the caller.
use std::{collections::HashMap, path::PathBuf, time::Duration};

use eyre::WrapErr;
use retry::{OperationResult, delay::Fixed, retry};
use serde::{Deserialize, Serialize};
use transport::PortProbe;

pub mod java;
pub mod native;
mod process;
pub mod python;

pub use java::{JavaBridge, JavaSettings, JavaToolchain};
pub use native::{NativeBridge, NativeSettings};
pub use process::ManagedChild;
pub use python::{PythonBridge, PythonSettings};

/// Interval between readiness probes
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Which stream a line of process output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Messages from the adapter itself rather than the debuggee
    Normal,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
            OutputStream::Normal => "normal",
        }
    }
}

impl std::str::FromStr for OutputStream {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "normal" => Ok(Self::Normal),
            other => Err(eyre::eyre!("invalid output stream {other}")),
        }
    }
}

/// The run target resolved by the Java language server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavaTarget {
    pub workspace: PathBuf,
    pub main_class: String,
    pub project_name: String,
    pub class_paths: Vec<String>,
}

/// Where a debug adapter for one session is listening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DapEndpoint {
    pub session_id: String,
    pub kit: String,
    pub port: u16,
    pub project_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java: Option<JavaTarget>,
}

/// Notifications from a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The backend is listening; readiness is reported once per request
    Ready(DapEndpoint),
    Output {
        session_id: String,
        stream: OutputStream,
        text: String,
    },
    /// A managed process went away
    Exited {
        session_id: String,
        kit: String,
        code: Option<i32>,
    },
    /// The backend could not provide a port for the session
    Failed {
        session_id: String,
        kit: String,
        error: String,
    },
}

/// What a session asks a bridge for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRequest {
    /// Correlates readiness with the session that asked
    pub session_id: String,
    pub project_path: PathBuf,
    /// Script, trigger file or executable, depending on the backend
    pub target: Option<PathBuf>,
    pub arguments: Vec<String>,
    /// Per-request override of the configured Java toolchain
    pub java: Option<JavaToolchain>,
}

/// Capability shared by every backend bridge
pub trait DebuggerBackend: Send {
    /// The canonical kit name of this backend
    fn kit(&self) -> &'static str;

    /// Prepare a debug adapter for `request`.
    ///
    /// Precondition failures are returned directly and nothing is spawned.
    /// Readiness is reported later as [`BridgeEvent::Ready`].
    fn request_port(&mut self, request: PortRequest) -> eyre::Result<()>;

    /// Tear down whatever this backend spawned for the current session
    fn stop(&mut self);
}

/// Kit name lookup table selecting the backend for a project
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, Box<dyn DebuggerBackend>>,
    aliases: HashMap<String, &'static str>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own kit name and any number of aliases.
    pub fn register(&mut self, backend: Box<dyn DebuggerBackend>, aliases: &[&str]) {
        let kit = backend.kit();
        tracing::debug!(%kit, ?aliases, "registering backend");
        for alias in aliases {
            self.aliases.insert(alias.to_string(), kit);
        }
        self.aliases.insert(kit.to_string(), kit);
        self.backends.insert(kit, backend);
    }

    /// Register the three built-in bridges with their usual build-system
    /// aliases.
    pub fn with_defaults(
        native: NativeBridge,
        java: JavaBridge,
        python: PythonBridge,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(native), &["cmake", "ninja", "cpp", "c"]);
        registry.register(Box::new(java), &["gradle", "maven"]);
        registry.register(Box::new(python), &["py"]);
        registry
    }

    /// Canonical kit name for `kit`, if any backend handles it
    pub fn resolve(&self, kit: &str) -> Option<&'static str> {
        self.aliases.get(kit).copied()
    }

    pub fn get_mut(&mut self, kit: &str) -> Option<&mut (dyn DebuggerBackend + 'static)> {
        let canonical = self.resolve(kit)?;
        self.backends.get_mut(canonical).map(|b| b.as_mut())
    }

    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub fn request_port(&mut self, kit: &str, request: PortRequest) -> eyre::Result<()> {
        let backend = self
            .get_mut(kit)
            .ok_or_else(|| eyre::eyre!("no debugger backend for kit {kit}"))?;
        backend
            .request_port(request)
            .wrap_err_with(|| format!("requesting port from {kit} backend"))
    }

    pub fn stop(&mut self, kit: &str) {
        if let Some(backend) = self.get_mut(kit) {
            backend.stop();
        }
    }

    pub fn stop_all(&mut self) {
        for backend in self.backends.values_mut() {
            backend.stop();
        }
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// How a readiness wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The port was seen listening
    Bound,
    /// The bound elapsed without seeing the port; proceed anyway
    Assumed,
}

enum NotReady {
    Waiting,
    Exited(String),
}

/// Wait for a freshly spawned process to listen on `port`.
///
/// Probes every few milliseconds up to `bound`. Fails early if the process
/// exits, otherwise falls back to [`Readiness::Assumed`] once `bound` has
/// elapsed.
pub(crate) fn wait_for_port(
    probe: &dyn PortProbe,
    port: u16,
    bound: Duration,
    child: &mut ManagedChild,
) -> eyre::Result<Readiness> {
    let attempts = (bound.as_millis() / READY_POLL_INTERVAL.as_millis()).max(1) as usize;
    let delays = Fixed::from_millis(READY_POLL_INTERVAL.as_millis() as u64).take(attempts);
    let result = retry(delays, || {
        if probe.is_bound(port) {
            return OperationResult::Ok(());
        }
        match child.try_status() {
            Some(status) => OperationResult::Err(NotReady::Exited(status)),
            None => OperationResult::Retry(NotReady::Waiting),
        }
    });

    match result {
        Ok(()) => {
            tracing::debug!(%port, "port bound");
            Ok(Readiness::Bound)
        }
        Err(retry::Error {
            error: NotReady::Exited(status),
            ..
        }) => eyre::bail!("process exited before binding port {port}: {status}"),
        Err(retry::Error {
            error: NotReady::Waiting,
            ..
        }) => {
            tracing::warn!(%port, ?bound, "port not seen bound, assuming ready");
            Ok(Readiness::Assumed)
        }
    }
}
