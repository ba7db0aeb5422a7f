//! The debug adapter process
//!
//! [`DebugEngine`] hosts one [`Debugger`] session together with the backend
//! bridges, and connects both to the bus: launch and command signals from
//! front-ends drive the bridges and the session, while bridge readiness,
//! output and session state are published back.
use std::{
    sync::{Arc, Mutex},
    thread,
};

use bus::{Command, LocalBus, PeerId, Signal};
use config::Settings;
use debugger::{Breakpoint, Debugger, Event};
use eyre::WrapErr;
use server::{
    BackendRegistry, BridgeEvent, DapEndpoint, JavaBridge, NativeBridge, OutputStream, PortRequest,
    PythonBridge,
};
use state::StateManager;
use transport::PortAllocator;

pub struct DebugEngine {
    bus: LocalBus,
    peer: PeerId,
    signals: crossbeam_channel::Receiver<Signal>,
    bridge_events: crossbeam_channel::Receiver<BridgeEvent>,
    session_events: crossbeam_channel::Receiver<Event>,
    allocator: PortAllocator,
    backends: Arc<Mutex<BackendRegistry>>,
    debugger: Arc<Debugger>,
    state: Mutex<StateManager>,
    /// gdb for native targets that do not name one
    debugger_path: String,
}

impl DebugEngine {
    /// Build an engine with the native, Java and Python bridges.
    pub fn new(settings: &Settings, bus: LocalBus) -> eyre::Result<Self> {
        let (tx, bridge_events) = crossbeam_channel::unbounded();
        let allocator = PortAllocator::new();
        let registry = BackendRegistry::with_defaults(
            NativeBridge::new(settings.native.clone(), tx.clone()),
            JavaBridge::new(settings.java.clone(), allocator.clone(), tx.clone()),
            PythonBridge::new(settings.python.clone(), allocator.clone(), tx),
        );
        Self::with_backends(settings, bus, allocator, registry, bridge_events)
    }

    /// Build an engine around an existing registry whose bridges report on
    /// `bridge_events`.
    pub fn with_backends(
        settings: &Settings,
        bus: LocalBus,
        allocator: PortAllocator,
        registry: BackendRegistry,
        bridge_events: crossbeam_channel::Receiver<BridgeEvent>,
    ) -> eyre::Result<Self> {
        let backends = Arc::new(Mutex::new(registry));
        let debugger = Debugger::new(Arc::clone(&backends))
            .with_request_timeout(settings.request_timeout);
        let session_events = debugger.events();

        let state = StateManager::new(settings.state_path()).wrap_err("opening breakpoint state")?;
        let saved = state.breakpoints();
        tracing::debug!(count = saved.len(), "restoring breakpoints");
        debugger
            .load_breakpoints(saved)
            .wrap_err("restoring breakpoints")?;

        let (peer, signals) = bus.subscribe_peer();
        Ok(Self {
            bus,
            peer,
            signals,
            bridge_events,
            session_events,
            allocator,
            backends,
            debugger: Arc::new(debugger),
            state: Mutex::new(state),
            debugger_path: settings.native.debugger_path.clone(),
        })
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Serve signals until `shutdown` fires or its sender is dropped.
    pub fn run(&self, shutdown: &crossbeam_channel::Receiver<()>) -> eyre::Result<()> {
        tracing::info!("debug engine running");
        loop {
            crossbeam_channel::select! {
                recv(self.signals) -> signal => match signal {
                    Ok(signal) => self.handle_signal(signal),
                    Err(_) => eyre::bail!("bus closed"),
                },
                recv(self.bridge_events) -> event => match event {
                    Ok(event) => self.handle_bridge_event(event),
                    Err(_) => eyre::bail!("every backend bridge went away"),
                },
                recv(self.session_events) -> event => match event {
                    Ok(event) => self.handle_session_event(event),
                    Err(_) => eyre::bail!("debug session went away"),
                },
                recv(shutdown) -> _ => break,
            }
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        tracing::info!("shutting down debug engine");
        if let Err(e) = self.debugger.abort_debug() {
            tracing::warn!(error = %e, "ending session");
        }
        match self.backends.lock() {
            Ok(mut backends) => backends.stop_all(),
            Err(e) => tracing::warn!(error = %e, "backend registry poisoned"),
        }
    }

    fn publish(&self, signal: Signal) {
        self.bus.publish_from(Some(self.peer), signal);
    }

    fn publish_output(&self, stream: OutputStream, text: impl Into<String>) {
        self.publish(Signal::Output {
            stream,
            text: text.into(),
        });
    }

    #[tracing::instrument(skip(self, signal), fields(signal = signal.name()))]
    fn handle_signal(&self, signal: Signal) {
        tracing::debug!(?signal, "received signal");
        let result = match signal {
            Signal::LaunchJavaDap(launch) => self.request_port(server::java::KIT, launch.into()),
            Signal::LaunchPythonDap(launch) => {
                self.request_port(server::python::KIT, launch.into())
            }
            Signal::GetDebugPort { session_id } => self.request_port(
                server::native::KIT,
                PortRequest {
                    session_id,
                    ..Default::default()
                },
            ),
            Signal::DapPort(endpoint) => {
                self.deliver_port(endpoint);
                Ok(())
            }
            Signal::Command(command) => {
                // user-facing failures already arrive as session error events
                if let Err(e) = self.handle_command(command) {
                    tracing::warn!(error = %e, "handling command");
                }
                Ok(())
            }
            Signal::Output { .. }
            | Signal::RunState(_)
            | Signal::Breakpoints(_)
            | Signal::Threads { .. }
            | Signal::Stack { .. }
            | Signal::Variables { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "handling signal");
            self.publish_output(OutputStream::Normal, format!("{e:#}"));
        }
    }

    fn request_port(&self, kit: &str, request: PortRequest) -> eyre::Result<()> {
        let mut backends = self
            .backends
            .lock()
            .map_err(|e| eyre::eyre!("backend registry poisoned: {e}"))?;
        backends.request_port(kit, request)
    }

    /// Connecting to the adapter can take a while, so it happens off the
    /// signal loop.
    fn deliver_port(&self, endpoint: DapEndpoint) {
        let debugger = Arc::clone(&self.debugger);
        thread::spawn(move || {
            if let Err(e) = debugger.on_port_ready(&endpoint) {
                tracing::warn!(
                    error = %e,
                    session_id = %endpoint.session_id,
                    "connecting to debug adapter"
                );
            }
        });
    }

    fn handle_command(&self, command: Command) -> eyre::Result<()> {
        let debugger = &self.debugger;
        match command {
            Command::SetProject(mut target) => {
                if target.debugger_path.is_none() {
                    target.debugger_path = Some(self.debugger_path.clone());
                }
                debugger.set_project(Box::new(target))
            }
            Command::Coredump { target, core } => {
                debugger.run_coredump(&target, &core, Some(self.debugger_path.clone()))
            }
            Command::Start => debugger.start_debug(),
            Command::Restart => debugger.restart_debug(),
            Command::Abort => debugger.abort_debug(),
            Command::Detach => debugger.detach_debug(),
            Command::Interrupt => debugger.interrupt_debug(),
            Command::Continue => debugger.continue_debug(),
            Command::StepOver => debugger.step_over(),
            Command::StepIn => debugger.step_in(),
            Command::StepOut => debugger.step_out(),
            Command::BuildFinished(success) => debugger.on_build_finished(success),
            Command::SelectThread(id) => debugger.switch_current_thread(id),
            // the variables reach front-ends as a session event
            Command::SelectFrame(index) => debugger.slot_frame_selected(index).map(|_| ()),
            Command::AddBreakpoint { file, line } => {
                debugger.add_breakpoint(Breakpoint::new(file, line))
            }
            Command::RemoveBreakpoint { file, line } => debugger.remove_breakpoint(&file, line),
            Command::SetBreakpointEnabled {
                file,
                line,
                enabled,
            } => debugger.set_breakpoint_enabled(&file, line, enabled),
            Command::SetBreakpointCondition {
                file,
                line,
                condition,
            } => debugger.set_breakpoint_condition(&file, line, condition),
            Command::SetAllBreakpointsEnabled(enabled) => {
                debugger.set_all_breakpoints_enabled(enabled)
            }
            Command::RemoveBreakpointsInFile(file) => debugger.remove_breakpoints_in_file(&file),
        }
    }

    fn handle_bridge_event(&self, event: BridgeEvent) {
        tracing::debug!(?event, "bridge event");
        match event {
            BridgeEvent::Ready(endpoint) => {
                self.publish(Signal::DapPort(endpoint.clone()));
                self.deliver_port(endpoint);
            }
            BridgeEvent::Output { stream, text, .. } => self.publish_output(stream, text),
            BridgeEvent::Exited {
                session_id,
                kit,
                code,
            } => {
                let text = match code {
                    Some(code) => format!("{kit} backend exited with code {code}"),
                    None => format!("{kit} backend was killed"),
                };
                self.publish_output(OutputStream::Normal, text);
                if let Err(e) = self.debugger.on_backend_exited(&session_id, code) {
                    tracing::warn!(error = %e, "ending session after backend exit");
                }
            }
            BridgeEvent::Failed {
                session_id,
                kit,
                error,
            } => {
                self.publish_output(OutputStream::Normal, format!("{kit} backend failed: {error}"));
                if let Err(e) = self.debugger.on_backend_failed(&session_id, &error) {
                    tracing::warn!(error = %e, "ending session after backend failure");
                }
            }
        }
    }

    fn handle_session_event(&self, event: Event) {
        match event {
            Event::RunState(state) => self.publish(Signal::RunState(state)),
            Event::Output(line) => self.publish_output(line.stream, line.text),
            Event::Error(message) => self.publish_output(OutputStream::Normal, message),
            Event::Breakpoints { breakpoints, .. } => {
                if let Err(e) = self.save_breakpoints(&breakpoints) {
                    tracing::warn!(error = %e, "saving breakpoints");
                }
                self.publish(Signal::Breakpoints(breakpoints));
            }
            Event::Threads { threads, current } => {
                self.publish(Signal::Threads { threads, current })
            }
            Event::Stack {
                thread_id,
                frames,
                current,
                can_expand,
            } => self.publish(Signal::Stack {
                thread_id,
                frames,
                current,
                can_expand,
            }),
            Event::Variables {
                frame_id,
                variables,
            } => self.publish(Signal::Variables {
                frame_id,
                variables,
            }),
        }
    }

    fn save_breakpoints(&self, breakpoints: &[Breakpoint]) -> eyre::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| eyre::eyre!("state mutex poisoned: {e}"))?;
        state.set_breakpoints(breakpoints);
        state.save()
    }
}
