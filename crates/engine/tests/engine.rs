use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{IsTerminal, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bus::{Command, LocalBus, PythonLaunch, Signal};
use bytes::BytesMut;
use config::Settings;
use debugger::{Breakpoint, DebugTarget, RunState};
use engine::DebugEngine;
use serde_json::{Value, json};
use server::{BackendRegistry, BridgeEvent, DapEndpoint, DebuggerBackend, OutputStream, PortRequest};
use tokio_util::codec::Encoder;
use tracing_subscriber::EnvFilter;
use transport::{
    FrameCodec, FrameReader, Message, PortAllocator,
    message::{Event as DapEvent, Request, Response},
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct RecordingBackend {
    kit: &'static str,
    requests: crossbeam_channel::Sender<PortRequest>,
    stops: Arc<AtomicUsize>,
}

impl DebuggerBackend for RecordingBackend {
    fn kit(&self) -> &'static str {
        self.kit
    }

    fn request_port(&mut self, request: PortRequest) -> eyre::Result<()> {
        self.requests
            .send(request)
            .map_err(|e| eyre::eyre!("recording request: {e}"))
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct EngineFixture {
    bus: LocalBus,
    signals: crossbeam_channel::Receiver<Signal>,
    buffered: RefCell<VecDeque<Signal>>,
    bridge: crossbeam_channel::Sender<BridgeEvent>,
    requests: crossbeam_channel::Receiver<PortRequest>,
    stops: Arc<AtomicUsize>,
    engine: Arc<DebugEngine>,
    shutdown: Option<crossbeam_channel::Sender<()>>,
    handle: Option<JoinHandle<eyre::Result<()>>>,
}

impl EngineFixture {
    fn start(state_file: &Path) -> Self {
        Self::with_settings(Settings {
            state_file: Some(state_file.to_path_buf()),
            ..Default::default()
        })
    }

    fn with_settings(settings: Settings) -> Self {
        let (requests_tx, requests) = crossbeam_channel::unbounded();
        let stops = Arc::new(AtomicUsize::new(0));
        let mut registry = BackendRegistry::new();
        registry.register(
            Box::new(RecordingBackend {
                kit: server::native::KIT,
                requests: requests_tx.clone(),
                stops: Arc::clone(&stops),
            }),
            &["cmake"],
        );
        registry.register(
            Box::new(RecordingBackend {
                kit: server::python::KIT,
                requests: requests_tx,
                stops: Arc::clone(&stops),
            }),
            &[],
        );

        let bus = LocalBus::new();
        let signals = bus.subscribe();
        let (bridge, bridge_events) = crossbeam_channel::unbounded();
        let engine = Arc::new(
            DebugEngine::with_backends(
                &settings,
                bus.clone(),
                PortAllocator::new(),
                registry,
                bridge_events,
            )
            .unwrap(),
        );

        let (shutdown, shutdown_rx) = crossbeam_channel::bounded(0);
        let handle = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.run(&shutdown_rx))
        };

        Self {
            bus,
            signals,
            buffered: RefCell::new(VecDeque::new()),
            bridge,
            requests,
            stops,
            engine,
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    /// Wait for a signal matching the predicate, buffering the others
    fn wait_for_signal<F>(&self, message: &str, pred: F) -> Signal
    where
        F: Fn(&Signal) -> bool,
    {
        let mut buffered = self.buffered.borrow_mut();
        if let Some(pos) = buffered.iter().position(&pred) {
            return buffered.remove(pos).unwrap();
        }

        let deadline = Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.signals.recv_timeout(remaining) {
                Ok(signal) if pred(&signal) => return signal,
                Ok(signal) => {
                    tracing::trace!(?signal, "non-matching signal, buffering for later");
                    buffered.push_back(signal);
                }
                Err(_) => panic!("timed out waiting for {message}"),
            }
        }
    }

    fn next_request(&self) -> PortRequest {
        self.requests
            .recv_timeout(TIMEOUT)
            .expect("no port request reached the backend")
    }

    fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

impl Drop for EngineFixture {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.stop();
        }
    }
}

fn state_breakpoints(path: &Path) -> Vec<Breakpoint> {
    state::load_from(path)
        .map(|state| {
            state
                .files
                .into_iter()
                .flat_map(|file| file.breakpoints)
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn get_debug_port_goes_to_native_backend() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = EngineFixture::start(&dir.path().join("state.json"));

    fixture.bus.publish(Signal::GetDebugPort {
        session_id: "native-1".to_string(),
    });

    let request = fixture.next_request();
    assert_eq!(request.session_id, "native-1");
    assert_eq!(request.target, None);
}

#[test]
fn python_launch_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = EngineFixture::start(&dir.path().join("state.json"));

    fixture
        .bus
        .publish(Signal::LaunchPythonDap(PythonLaunch {
            session_id: "py-1".to_string(),
            project_path: PathBuf::from("/work"),
            script: PathBuf::from("/work/app.py"),
            arguments: vec!["--fast".to_string()],
        }));

    let request = fixture.next_request();
    assert_eq!(request.session_id, "py-1");
    assert_eq!(request.target, Some(PathBuf::from("/work/app.py")));
    assert_eq!(request.arguments, vec!["--fast".to_string()]);
}

#[test]
fn launch_without_backend_reports_output() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = EngineFixture::start(&dir.path().join("state.json"));

    fixture.bus.publish(Signal::LaunchJavaDap(Default::default()));

    fixture.wait_for_signal("launch failure", |signal| {
        matches!(signal, Signal::Output { text, .. } if text.contains("no debugger backend for kit java"))
    });
}

#[test]
fn ready_backend_is_announced() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = EngineFixture::start(&dir.path().join("state.json"));

    let endpoint = DapEndpoint {
        session_id: "py-2".to_string(),
        kit: server::python::KIT.to_string(),
        port: 7000,
        project_path: PathBuf::from("/work"),
        java: None,
    };
    fixture
        .bridge
        .send(BridgeEvent::Ready(endpoint.clone()))
        .unwrap();

    let signal = fixture.wait_for_signal("dapport", |signal| matches!(signal, Signal::DapPort(_)));
    assert_eq!(signal, Signal::DapPort(endpoint));
}

#[test]
fn backend_output_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = EngineFixture::start(&dir.path().join("state.json"));

    fixture
        .bridge
        .send(BridgeEvent::Output {
            session_id: "s".to_string(),
            stream: OutputStream::Stderr,
            text: "warming up\n".to_string(),
        })
        .unwrap();

    let signal = fixture.wait_for_signal("output", |signal| matches!(signal, Signal::Output { .. }));
    assert_eq!(
        signal,
        Signal::Output {
            stream: OutputStream::Stderr,
            text: "warming up\n".to_string(),
        }
    );
}

#[test]
fn start_command_drives_session_state() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = EngineFixture::start(&dir.path().join("state.json"));

    fixture
        .bus
        .publish(Signal::Command(Command::SetProject(DebugTarget {
            kit: "cmake".to_string(),
            project_path: dir.path().to_path_buf(),
            program: Some(dir.path().join("a.out")),
            ..Default::default()
        })));
    fixture.bus.publish(Signal::Command(Command::Start));

    fixture.wait_for_signal("preparing", |signal| {
        *signal == Signal::RunState(RunState::Preparing)
    });
    let request = fixture.next_request();
    assert!(!request.session_id.is_empty());
    assert_eq!(request.target, Some(dir.path().join("a.out")));

    fixture
        .bridge
        .send(BridgeEvent::Exited {
            session_id: request.session_id,
            kit: server::native::KIT.to_string(),
            code: Some(2),
        })
        .unwrap();
    fixture.wait_for_signal("exit output", |signal| {
        matches!(signal, Signal::Output { text, .. } if text.contains("exited with code 2"))
    });
    fixture.wait_for_signal("no run", |signal| *signal == Signal::RunState(RunState::NoRun));
    assert_eq!(fixture.engine.debugger().run_state().unwrap(), RunState::NoRun);
}

#[test]
fn breakpoints_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let source = dir.path().join("main.c");

    {
        let fixture = EngineFixture::start(&state_file);
        fixture.bus.publish(Signal::Command(Command::AddBreakpoint {
            file: source.clone(),
            line: 12,
        }));
        fixture.bus.publish(Signal::Command(Command::SetBreakpointCondition {
            file: source.clone(),
            line: 12,
            condition: Some("i > 2".to_string()),
        }));

        let deadline = Instant::now() + TIMEOUT;
        loop {
            let saved = state_breakpoints(&state_file);
            if saved
                .iter()
                .any(|bp| bp.line == 12 && bp.condition.as_deref() == Some("i > 2"))
            {
                break;
            }
            assert!(Instant::now() < deadline, "breakpoint was never saved");
            thread::sleep(Duration::from_millis(20));
        }
    }

    let fixture = EngineFixture::start(&state_file);
    let restored = fixture.engine.debugger().breakpoints().unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].file_path, source);
    assert_eq!(restored[0].condition.as_deref(), Some("i > 2"));
    assert!(!restored[0].verified);
}

#[test]
fn shutdown_stops_backends() {
    let dir = tempfile::tempdir().unwrap();
    let mut fixture = EngineFixture::start(&dir.path().join("state.json"));
    fixture.stop();
    assert!(fixture.stops.load(Ordering::SeqCst) >= 2);
}

#[test]
fn session_snapshots_reach_the_bus() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.c");
    std::fs::write(&source, "int main() {}\n").unwrap();
    let mut settings = Settings {
        state_file: Some(dir.path().join("state.json")),
        ..Default::default()
    };
    settings.native.debugger_path = "/opt/toolchain/bin/gdb".to_string();
    let fixture = EngineFixture::with_settings(settings);

    fixture.bus.publish(Signal::Command(Command::AddBreakpoint {
        file: source.clone(),
        line: 4,
    }));
    let Signal::Breakpoints(staged) = fixture.wait_for_signal("staged breakpoint", |signal| {
        matches!(signal, Signal::Breakpoints(_))
    }) else {
        unreachable!()
    };
    assert_eq!(staged.len(), 1);
    assert!(!staged[0].verified);

    fixture
        .bus
        .publish(Signal::Command(Command::SetProject(DebugTarget {
            kit: "native".to_string(),
            project_path: dir.path().to_path_buf(),
            program: Some(dir.path().join("app")),
            ..Default::default()
        })));
    fixture.bus.publish(Signal::Command(Command::Start));
    let request = fixture.next_request();

    let adapter = ScriptedAdapter::spawn(source.clone());
    fixture
        .bridge
        .send(BridgeEvent::Ready(DapEndpoint {
            session_id: request.session_id,
            kit: server::native::KIT.to_string(),
            port: adapter.port,
            project_path: dir.path().to_path_buf(),
            java: None,
        }))
        .unwrap();

    let launch = adapter.wait_for_command("launch");
    assert_eq!(
        launch.arguments.unwrap()["miDebuggerPath"],
        "/opt/toolchain/bin/gdb"
    );

    fixture.wait_for_signal("verified breakpoint", |signal| {
        matches!(
            signal,
            Signal::Breakpoints(bps) if !bps.is_empty() && bps.iter().all(|bp| bp.verified)
        )
    });
    fixture.wait_for_signal("stopped", |signal| {
        *signal == Signal::RunState(RunState::Stopped)
    });
    let Signal::Threads { threads, current } =
        fixture.wait_for_signal("threads", |signal| {
            matches!(signal, Signal::Threads { threads, .. } if !threads.is_empty())
        })
    else {
        unreachable!()
    };
    assert_eq!(threads[current].name, "main");
    let Signal::Stack {
        thread_id, frames, ..
    } = fixture.wait_for_signal("stack", |signal| {
        matches!(signal, Signal::Stack { frames, .. } if !frames.is_empty())
    })
    else {
        unreachable!()
    };
    assert_eq!(thread_id, 1);
    assert_eq!(frames[0].function, "main");

    fixture.bus.publish(Signal::Command(Command::SelectFrame(0)));
    let Signal::Variables { variables, .. } = fixture.wait_for_signal("variables", |signal| {
        matches!(signal, Signal::Variables { .. })
    }) else {
        unreachable!()
    };
    assert_eq!(variables[0].name, "i");
    assert_eq!(variables[0].value, "2");

    fixture.bus.publish(Signal::Command(Command::Abort));
    adapter.wait_for_command("disconnect");
    fixture.wait_for_signal("no run", |signal| *signal == Signal::RunState(RunState::NoRun));
}

#[test]
fn coredump_starts_a_native_session() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = EngineFixture::start(&dir.path().join("state.json"));
    let target = dir.path().join("app");
    let core = dir.path().join("core.4242");
    std::fs::write(&target, b"").unwrap();

    fixture.bus.publish(Signal::Command(Command::Coredump {
        target: target.clone(),
        core: core.clone(),
    }));
    fixture.wait_for_signal("missing core", |signal| {
        matches!(signal, Signal::Output { text, .. } if text.contains("is not a file"))
    });
    assert_eq!(fixture.engine.debugger().run_state().unwrap(), RunState::NoRun);

    std::fs::write(&core, b"").unwrap();
    fixture.bus.publish(Signal::Command(Command::Coredump {
        target: target.clone(),
        core: core.clone(),
    }));
    fixture.wait_for_signal("preparing", |signal| {
        *signal == Signal::RunState(RunState::Preparing)
    });
    let request = fixture.next_request();
    assert_eq!(request.target, Some(target));
    assert_eq!(request.arguments, vec![core.display().to_string()]);
}

/// Serves one native session: stops on the first breakpoint and answers
/// snapshot requests.
struct ScriptedAdapter {
    port: u16,
    commands: crossbeam_channel::Receiver<Request>,
}

impl ScriptedAdapter {
    fn spawn(source: PathBuf) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, commands) = crossbeam_channel::unbounded();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = FrameReader::<_, Message>::new(stream.try_clone().unwrap());
            let mut writer = AdapterWriter { stream, seq: 0 };

            while let Ok(Some(message)) = reader.next_message() {
                let Message::Request(request) = message else {
                    continue;
                };
                let _ = tx.send(request.clone());
                let body = match request.command.as_str() {
                    "initialize" => json!({ "supportsConfigurationDoneRequest": true }),
                    "setBreakpoints" => {
                        let count = request.arguments.as_ref().unwrap()["breakpoints"]
                            .as_array()
                            .map_or(0, Vec::len);
                        let breakpoints: Vec<Value> =
                            (0..count).map(|i| json!({ "id": i, "verified": true })).collect();
                        json!({ "breakpoints": breakpoints })
                    }
                    "threads" => json!({ "threads": [{ "id": 1, "name": "main" }] }),
                    "stackTrace" => json!({
                        "stackFrames": [
                            { "id": 1000, "name": "main", "source": { "path": source }, "line": 4, "column": 1 },
                        ],
                        "totalFrames": 1,
                    }),
                    "scopes" => json!({
                        "scopes": [{ "name": "Locals", "variablesReference": 7, "expensive": false }],
                    }),
                    "variables" => json!({
                        "variables": [{ "name": "i", "value": "2", "type": "int", "variablesReference": 0 }],
                    }),
                    _ => Value::Null,
                };
                writer.respond(&request, body);
                match request.command.as_str() {
                    "launch" => writer.event("initialized", None),
                    "configurationDone" => writer.event(
                        "stopped",
                        Some(json!({ "reason": "breakpoint", "threadId": 1 })),
                    ),
                    "disconnect" => break,
                    _ => {}
                }
            }
        });

        Self { port, commands }
    }

    fn wait_for_command(&self, command: &str) -> Request {
        loop {
            let request = self
                .commands
                .recv_timeout(TIMEOUT)
                .unwrap_or_else(|_| panic!("adapter never received {command}"));
            if request.command == command {
                return request;
            }
        }
    }
}

struct AdapterWriter {
    stream: TcpStream,
    seq: i64,
}

impl AdapterWriter {
    fn write(&mut self, message: Message) {
        let mut buffer = BytesMut::new();
        FrameCodec::<Message>::new()
            .encode(message, &mut buffer)
            .unwrap();
        let _ = self.stream.write_all(&buffer);
    }

    fn respond(&mut self, request: &Request, body: Value) {
        self.seq += 1;
        self.write(Message::Response(Response {
            seq: self.seq,
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body: (!body.is_null()).then_some(body),
        }));
    }

    fn event(&mut self, event: &str, body: Option<Value>) {
        self.seq += 1;
        self.write(Message::Event(DapEvent {
            seq: self.seq,
            event: event.to_string(),
            body,
        }));
    }
}

// test suite "constructor"
#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}
