//! Java backend
//!
//! The Java debug adapter lives inside the Eclipse JDT language server. The
//! bridge starts that server once, talks JSON-RPC to it over stdio and runs a
//! [`Handshake`] per session to obtain the adapter port and run target.
use std::{
    io::Write,
    path::PathBuf,
    process::{ChildStdin, ChildStdout, Command},
    thread,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, select};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Encoder;
use transport::{
    FrameCodec, FrameReader, PollResult, PortAllocator, PortReservation, Transport,
    jsonrpc::{Incoming, RequestMessage, ResponseMessage},
};

use crate::{BridgeEvent, DebuggerBackend, ManagedChild, OutputStream, PortRequest};

mod handshake;
mod params;

pub use handshake::{Action, Handshake, SessionStart};
pub use params::{JavaToolchain, backend_args, initialize_params};

pub const KIT: &str = "java";

/// How often pending language server requests are checked for expiry
const EXPIRE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JavaSettings {
    /// JDWP ports are searched downward from here
    pub start_port: u16,
    /// How long each language server request may stay unanswered
    #[serde(with = "crate::millis")]
    pub request_timeout: Duration,
    pub toolchain: JavaToolchain,
}

impl Default for JavaSettings {
    fn default() -> Self {
        Self {
            start_port: 6000,
            request_timeout: transport::DEFAULT_REQUEST_TIMEOUT,
            toolchain: JavaToolchain::default(),
        }
    }
}

/// Language server stdio as a [`Transport`]
struct StdioTransport {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl Transport for StdioTransport {
    type Reader = ChildStdout;
    type Writer = ChildStdin;

    fn split(self) -> eyre::Result<(Self::Reader, Self::Writer)> {
        Ok((self.stdout, self.stdin))
    }
}

enum DriverCommand {
    Begin(SessionStart),
    Cancel,
}

/// A running language server and the threads driving it
struct LanguageServer {
    commands: Sender<DriverCommand>,
    /// Workspace the server was initialised with
    workspace: Option<PathBuf>,
    toolchain: JavaToolchain,
    child: Option<ManagedChild>,
    _jdwp: Option<PortReservation>,
}

impl LanguageServer {
    fn start<T: Transport>(
        transport: T,
        toolchain: JavaToolchain,
        events: Sender<BridgeEvent>,
        timeout: Duration,
    ) -> eyre::Result<Self> {
        let (reader, writer) = transport.split()?;

        let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
        thread::spawn(move || {
            let mut reader = FrameReader::<_, Incoming>::new(reader);
            loop {
                match reader.poll_message() {
                    Ok(PollResult::Message(message)) => {
                        if incoming_tx.send(message).is_err() {
                            return;
                        }
                    }
                    Ok(PollResult::Timeout) => {}
                    Ok(PollResult::Closed) => {
                        tracing::debug!("language server closed stdout");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reading from language server");
                        return;
                    }
                }
            }
        });

        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        thread::spawn(move || {
            let driver = Driver {
                writer,
                codec: FrameCodec::new(),
                handshake: Handshake::new(timeout),
                events,
                session_id: String::new(),
            };
            driver.run(commands_rx, incoming_rx);
        });

        Ok(Self {
            commands: commands_tx,
            workspace: None,
            toolchain,
            child: None,
            _jdwp: None,
        })
    }

    fn is_alive(&mut self) -> bool {
        self.child.as_mut().is_none_or(|child| child.is_running())
    }
}

/// Owns the writing half and the handshake state
struct Driver<W> {
    writer: W,
    codec: FrameCodec<RequestMessage>,
    handshake: Handshake,
    events: Sender<BridgeEvent>,
    /// Session the latest output is attributed to
    session_id: String,
}

impl<W: Write> Driver<W> {
    fn run(mut self, commands: Receiver<DriverCommand>, incoming: Receiver<Incoming>) {
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(DriverCommand::Begin(start)) => {
                        self.session_id = start.session_id.clone();
                        for request in self.handshake.begin(start, Instant::now()) {
                            self.write(&request);
                        }
                    }
                    Ok(DriverCommand::Cancel) => {
                        self.handshake.cancel();
                    }
                    Err(_) => return,
                },
                recv(incoming) -> message => match message {
                    Ok(Incoming::Response(response)) => {
                        let actions = self.handshake.on_response(&response, Instant::now());
                        self.apply(actions);
                    }
                    Ok(Incoming::Request(request)) => self.on_server_request(request),
                    Err(_) => {
                        if let Some(session_id) = self.handshake.session_id() {
                            let _ = self.events.send(BridgeEvent::Failed {
                                session_id: session_id.to_string(),
                                kit: KIT.to_string(),
                                error: "language server exited during handshake".to_string(),
                            });
                        }
                        return;
                    }
                },
                default(EXPIRE_INTERVAL) => {
                    let actions = self.handshake.expire(Instant::now());
                    self.apply(actions);
                }
            }
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(request) => self.write(&request),
                Action::Ready(endpoint) => {
                    let _ = self.events.send(BridgeEvent::Ready(endpoint));
                }
                Action::Failed(error) => {
                    let _ = self.events.send(BridgeEvent::Failed {
                        session_id: self.session_id.clone(),
                        kit: KIT.to_string(),
                        error,
                    });
                }
            }
        }
    }

    /// Log messages become output; server requests are answered with null.
    fn on_server_request(&mut self, request: RequestMessage) {
        if let Some(message) = request.params.get("message").and_then(|m| m.as_str()) {
            let _ = self.events.send(BridgeEvent::Output {
                session_id: self.session_id.clone(),
                stream: OutputStream::Normal,
                text: message.to_string(),
            });
        } else {
            tracing::trace!(method = %request.method, "ignoring language server message");
        }

        if let Some(id) = request.id {
            self.write(&ResponseMessage::success(id, serde_json::Value::Null));
        }
    }

    fn write(&mut self, message: &impl Serialize) {
        let mut buffer = BytesMut::new();
        if let Err(e) = self.codec.encode(message, &mut buffer) {
            tracing::warn!(error = %e, "encoding language server message");
            return;
        }
        let result = self
            .writer
            .write_all(&buffer)
            .and_then(|_| self.writer.flush());
        if let Err(e) = result {
            tracing::warn!(error = %e, "writing to language server");
        }
    }
}

pub struct JavaBridge {
    settings: JavaSettings,
    allocator: PortAllocator,
    events: Sender<BridgeEvent>,
    process_id: u32,
    server: Option<LanguageServer>,
}

impl JavaBridge {
    pub fn new(
        settings: JavaSettings,
        allocator: PortAllocator,
        events: Sender<BridgeEvent>,
    ) -> Self {
        Self {
            settings,
            allocator,
            events,
            process_id: std::process::id(),
            server: None,
        }
    }

    /// Use an already running language server reachable over `transport`.
    pub fn with_transport<T: Transport>(
        settings: JavaSettings,
        allocator: PortAllocator,
        events: Sender<BridgeEvent>,
        transport: T,
    ) -> eyre::Result<Self> {
        let server = LanguageServer::start(
            transport,
            settings.toolchain.clone(),
            events.clone(),
            settings.request_timeout,
        )?;
        let mut bridge = Self::new(settings, allocator, events);
        bridge.server = Some(server);
        Ok(bridge)
    }

    fn spawn_server(
        &self,
        toolchain: JavaToolchain,
        session_id: &str,
    ) -> eyre::Result<LanguageServer> {
        let missing = toolchain.missing_files();
        if !missing.is_empty() {
            eyre::bail!("java toolchain incomplete, missing {missing:?}");
        }

        let jdwp = self.allocator.allocate(self.settings.start_port)?;
        tracing::info!(jdwp_port = %jdwp.port(), "starting java language server");
        let mut command = Command::new(toolchain.java_executable());
        command.args(backend_args(&toolchain, jdwp.port()));
        let (child, stdin, stdout) =
            ManagedChild::spawn_stdio(&mut command, KIT, session_id, self.events.clone())?;

        let mut server = LanguageServer::start(
            StdioTransport { stdin, stdout },
            toolchain,
            self.events.clone(),
            self.settings.request_timeout,
        )?;
        server.child = Some(child);
        server._jdwp = Some(jdwp);
        Ok(server)
    }
}

impl DebuggerBackend for JavaBridge {
    fn kit(&self) -> &'static str {
        KIT
    }

    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id))]
    fn request_port(&mut self, request: PortRequest) -> eyre::Result<()> {
        if !request.project_path.is_absolute() {
            eyre::bail!(
                "java project path must be absolute, got {:?}",
                request.project_path
            );
        }
        let toolchain = request
            .java
            .clone()
            .unwrap_or_else(|| self.settings.toolchain.clone());

        let reusable = match self.server.as_mut() {
            Some(server) if server.child.is_none() => true,
            Some(server) => {
                server.is_alive()
                    && server.toolchain == toolchain
                    && server
                        .workspace
                        .as_ref()
                        .is_none_or(|w| *w == request.project_path)
            }
            None => false,
        };
        if !reusable {
            if self.server.take().is_some() {
                tracing::info!("restarting java language server");
            }
            self.server = Some(self.spawn_server(toolchain.clone(), &request.session_id)?);
        }
        let Some(server) = self.server.as_mut() else {
            eyre::bail!("java language server unavailable");
        };

        let initialize = if server.workspace.as_ref() == Some(&request.project_path) {
            None
        } else {
            let params = initialize_params(
                self.process_id,
                &request.project_path,
                request.target.as_deref(),
                &toolchain,
            )?;
            server.workspace = Some(request.project_path.clone());
            Some(params)
        };

        if let Some(child) = server.child.as_ref() {
            child.set_session(&request.session_id);
        }
        server
            .commands
            .send(DriverCommand::Begin(SessionStart {
                session_id: request.session_id,
                workspace: request.project_path,
                initialize,
            }))
            .wrap_err("java language server driver stopped")
    }

    fn stop(&mut self) {
        // the language server is kept for the next session
        if let Some(server) = self.server.as_ref() {
            let _ = server.commands.send(DriverCommand::Cancel);
        }
    }
}
