use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use eyre::WrapErr;
use server::{BackendRegistry, OutputStream};
use transport::{
    Client,
    events::{self, StoppedEventBody},
    requests::{self, RequestBody},
    responses,
    types::{Source, ThreadId},
};

use crate::{
    Event, RunState,
    project::ProjectContext,
    registry::{Table, TableChange},
    types::{Breakpoint, OutputLine, StackFrame, Thread, Variable},
};

/// Frames fetched per stack trace request
const STACK_DEPTH: usize = 64;

pub(crate) struct DebuggerInternals {
    pub(crate) publisher: crossbeam_channel::Sender<Event>,
    pub(crate) backends: Arc<Mutex<BackendRegistry>>,

    pub(crate) project: Option<Box<dyn ProjectContext>>,
    pub(crate) state: RunState,
    pub(crate) session_id: Option<String>,
    /// Canonical kit of the backend serving the session
    pub(crate) kit: Option<&'static str>,
    pub(crate) awaiting_build: bool,

    pub(crate) client: Option<Client>,
    /// Bumped whenever a connection is made or torn down so that stale
    /// events can be told apart
    pub(crate) generation: u64,

    pub(crate) breakpoints: Table<Breakpoint>,
    pub(crate) threads: Table<Thread>,
    pub(crate) stack: Table<StackFrame>,
    pub(crate) stack_thread: Option<ThreadId>,
}

impl DebuggerInternals {
    pub(crate) fn new(
        publisher: crossbeam_channel::Sender<Event>,
        backends: Arc<Mutex<BackendRegistry>>,
    ) -> Self {
        Self {
            publisher,
            backends,
            project: None,
            state: RunState::NoRun,
            session_id: None,
            kit: None,
            awaiting_build: false,
            client: None,
            generation: 0,
            breakpoints: Table::new(),
            threads: Table::new(),
            stack: Table::new(),
            stack_thread: None,
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.publisher.send(event);
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "run state changed");
        self.state = state;
        self.emit(Event::RunState(state));
    }

    fn with_backends<R>(&self, f: impl FnOnce(&mut BackendRegistry) -> R) -> R {
        let mut backends = match self.backends.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("backend registry lock poisoned, continuing");
                poisoned.into_inner()
            }
        };
        f(&mut backends)
    }

    /// Report `error` and tear the session down.
    pub(crate) fn fail(&mut self, error: &eyre::Report) {
        tracing::warn!(error = %error, "debug session failed");
        self.emit(Event::Error(format!("{error:#}")));
        self.end_session();
    }

    /// Drop the connection, stop the backend and return to `NoRun`.
    pub(crate) fn end_session(&mut self) {
        self.awaiting_build = false;
        self.client = None;
        self.generation += 1;
        if let Some(kit) = self.kit.take() {
            self.with_backends(|backends| backends.stop(kit));
        }
        self.session_id = None;
        self.stack_thread = None;
        if !self.threads.is_empty() {
            self.threads.clear();
            self.emit_threads();
        }
        if !self.stack.is_empty() {
            self.stack.clear();
            self.emit_stack();
        }
        for bp in self.breakpoints.iter_mut() {
            bp.verified = false;
        }
        self.set_state(RunState::NoRun);
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn start_debug(&mut self) -> eyre::Result<()> {
        if self.state != RunState::NoRun {
            eyre::bail!("a debug session is already {}", self.state);
        }
        let Some(project) = self.project.as_mut() else {
            let error = eyre::eyre!("no active project to debug");
            self.emit(Event::Error(error.to_string()));
            return Err(error);
        };

        let kit_name = project.kit_name();
        let kit = self.with_backends(|backends| backends.resolve(&kit_name));
        let Some(kit) = kit else {
            let error = eyre::eyre!("no debugger backend for kit {kit_name}");
            self.emit(Event::Error(error.to_string()));
            return Err(error);
        };
        self.kit = Some(kit);
        self.set_state(RunState::Preparing);

        let Some(project) = self.project.as_mut() else {
            eyre::bail!("project went away");
        };
        if project.is_need_build() && !project.is_target_ready() {
            tracing::info!("target not ready, building first");
            if let Err(e) = project.request_build().wrap_err("requesting build") {
                self.fail(&e);
                return Err(e);
            }
            self.awaiting_build = true;
            return Ok(());
        }

        self.request_port()
    }

    pub(crate) fn on_build_finished(&mut self, success: bool) -> eyre::Result<()> {
        if !self.awaiting_build {
            tracing::debug!(%success, "ignoring build result, no start pending");
            return Ok(());
        }
        self.awaiting_build = false;
        if !success {
            let error = eyre::eyre!("build failed");
            self.fail(&error);
            return Err(error);
        }
        self.request_port()
    }

    fn request_port(&mut self) -> eyre::Result<()> {
        let result = self.try_request_port();
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn try_request_port(&mut self) -> eyre::Result<()> {
        let kit = self
            .kit
            .ok_or_else(|| eyre::eyre!("no backend selected"))?;
        let project = self
            .project
            .as_ref()
            .ok_or_else(|| eyre::eyre!("no active project to debug"))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let request = project
            .port_request(&session_id)
            .wrap_err("resolving debug arguments")?;
        self.session_id = Some(session_id.clone());

        tracing::info!(%kit, %session_id, "requesting debug port");
        self.with_backends(|backends| backends.request_port(kit, request))
    }

    /// Whether a bridge failure for `session_id` concerns this session
    pub(crate) fn is_current_session(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    #[tracing::instrument(skip(self, event), fields(%generation))]
    pub(crate) fn on_event(&mut self, generation: u64, event: events::Event) {
        if generation != self.generation {
            tracing::trace!(?event, "ignoring event from previous connection");
            return;
        }
        tracing::debug!(?event, "handling event");

        match event {
            events::Event::Initialized => {
                if let Err(e) = self.configure() {
                    self.fail(&e);
                }
            }
            events::Event::Stopped(body) if body.is_exception() => {
                let text = body
                    .text
                    .or(body.description)
                    .unwrap_or_else(|| "exception".to_string());
                self.emit(Event::Output(OutputLine::new(
                    OutputStream::Normal,
                    format!("stopped on exception: {text}"),
                )));
                self.disconnect(true);
            }
            events::Event::Stopped(body) => {
                if let Err(e) = self.on_stopped(body) {
                    tracing::warn!(error = %e, "handling stop");
                    self.emit(Event::Error(format!("{e:#}")));
                }
            }
            events::Event::Continued(_) => {
                self.clear_stack();
                self.set_state(RunState::Running);
            }
            events::Event::Thread(_) => {
                if let Err(e) = self.refresh_threads() {
                    tracing::warn!(error = %e, "refreshing threads");
                }
            }
            events::Event::Output(body) => {
                let line = OutputLine::from_category(body.category.as_deref(), body.output);
                self.emit(Event::Output(line));
            }
            events::Event::Exited(body) => {
                self.emit(Event::Output(OutputLine::new(
                    OutputStream::Normal,
                    format!("debuggee exited with code {}", body.exit_code),
                )));
                self.end_session();
            }
            events::Event::Terminated => self.end_session(),
            other => tracing::debug!(event = ?other, "unhandled event"),
        }
    }

    fn client(&self) -> eyre::Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| eyre::eyre!("not connected to a debug adapter"))
    }

    /// Send breakpoints, finish configuration and start running.
    fn configure(&mut self) -> eyre::Result<()> {
        let files: BTreeSet<PathBuf> = self
            .breakpoints
            .iter()
            .map(|bp| bp.file_path.clone())
            .collect();
        for file in files {
            self.send_breakpoints(&file)?;
        }

        let response = self
            .client()?
            .send(RequestBody::ConfigurationDone)
            .wrap_err("sending configurationDone")?;
        eyre::ensure!(
            response.success,
            "configurationDone failed: {}",
            response.message.as_deref().unwrap_or("no message")
        );

        self.refresh_threads()?;
        self.set_state(RunState::Running);
        Ok(())
    }

    /// Replace the adapter's breakpoints for `file` with the enabled ones we
    /// hold.
    pub(crate) fn send_breakpoints(&mut self, file: &Path) -> eyre::Result<()> {
        let enabled: Vec<Breakpoint> = self
            .breakpoints
            .iter()
            .filter(|bp| bp.is_in(file) && bp.enabled)
            .cloned()
            .collect();

        let response = self
            .client()?
            .send(RequestBody::SetBreakpoints(requests::SetBreakpoints {
                source: Source::from_path(file),
                breakpoints: enabled.iter().map(Breakpoint::to_source_breakpoint).collect(),
                source_modified: false,
            }))
            .wrap_err_with(|| format!("setting breakpoints in {}", file.display()))?;
        let confirmed: responses::SetBreakpointsResponse = response.body_as()?;

        let mut changes = Vec::new();
        for (bp, result) in enabled.iter().zip(confirmed.breakpoints.iter()) {
            if let Some(change) = self
                .breakpoints
                .update_with(bp, |bp| bp.verified = result.verified)
            {
                changes.push(change);
            }
        }
        if !changes.is_empty() {
            self.emit_breakpoints(changes);
        }
        Ok(())
    }

    /// Forward breakpoints for `file` if a session is attached.
    pub(crate) fn sync_breakpoints(&mut self, file: &Path) -> eyre::Result<()> {
        if !self.state.is_attached() || self.client.is_none() {
            tracing::debug!(file = %file.display(), "staging breakpoints until the next session");
            return Ok(());
        }
        self.send_breakpoints(file)
    }

    pub(crate) fn emit_breakpoints(&self, changes: Vec<TableChange>) {
        self.emit(Event::Breakpoints {
            breakpoints: self.breakpoints.rows().to_vec(),
            changes,
        });
    }

    fn emit_threads(&self) {
        self.emit(Event::Threads {
            threads: self.threads.rows().to_vec(),
            current: self.threads.current_index(),
        });
    }

    fn emit_stack(&self) {
        self.emit(Event::Stack {
            thread_id: self.stack_thread.unwrap_or_default(),
            frames: self.stack.rows().to_vec(),
            current: self.stack.current_index(),
            can_expand: self.stack.can_expand(),
        });
    }

    fn clear_stack(&mut self) {
        if !self.stack.is_empty() {
            self.stack.clear();
            self.emit_stack();
        }
    }

    fn refresh_threads(&mut self) -> eyre::Result<()> {
        let response = self
            .client()?
            .send(RequestBody::Threads)
            .wrap_err("fetching threads")?;
        let threads: responses::ThreadsResponse = response.body_as()?;

        let current = self.current_thread_id();
        self.threads
            .set_all(threads.threads.into_iter().map(Thread::from).collect(), false);
        if let Some(index) = current.and_then(|id| self.thread_index(id)) {
            self.threads.set_current_index(index);
        }
        self.emit_threads();
        Ok(())
    }

    fn thread_index(&self, id: ThreadId) -> Option<usize> {
        self.threads.iter().position(|t| t.id == id)
    }

    pub(crate) fn current_thread_id(&self) -> Option<ThreadId> {
        self.threads.current().map(|t| t.id)
    }

    fn on_stopped(&mut self, body: StoppedEventBody) -> eyre::Result<()> {
        self.refresh_threads()?;

        let thread_id = body
            .thread_id
            .or_else(|| self.current_thread_id())
            .ok_or_else(|| eyre::eyre!("stopped without any thread"))?;
        if let Some(index) = self.thread_index(thread_id) {
            if !self.threads.set_current_index(index).is_empty() {
                self.emit_threads();
            }
        }

        self.fetch_stack(thread_id)?;
        tracing::info!(reason = %body.reason, %thread_id, "debuggee stopped");
        self.set_state(RunState::Stopped);
        Ok(())
    }

    fn fetch_stack(&mut self, thread_id: ThreadId) -> eyre::Result<()> {
        let response = self
            .client()?
            .send(RequestBody::StackTrace(requests::StackTrace {
                thread_id,
                start_frame: None,
                levels: Some(STACK_DEPTH),
            }))
            .wrap_err("fetching stack trace")?;
        let trace: responses::StackTraceResponse = response.body_as()?;

        let frames: Vec<StackFrame> = trace
            .stack_frames
            .into_iter()
            .enumerate()
            .map(|(level, frame)| StackFrame::from_dap(level, frame))
            .collect();
        let can_expand = trace.total_frames.is_some_and(|total| total > frames.len());
        self.stack.set_all(frames, can_expand);
        self.stack_thread = Some(thread_id);
        self.emit_stack();
        Ok(())
    }

    pub(crate) fn switch_current_thread(&mut self, thread_id: ThreadId) -> eyre::Result<()> {
        if self.stack_thread == Some(thread_id) && self.current_thread_id() == Some(thread_id) {
            return Ok(());
        }
        let index = self
            .thread_index(thread_id)
            .ok_or_else(|| eyre::eyre!("unknown thread {thread_id}"))?;
        if !self.threads.set_current_index(index).is_empty() {
            self.emit_threads();
        }
        if self.state == RunState::Stopped {
            self.fetch_stack(thread_id)?;
        }
        Ok(())
    }

    pub(crate) fn select_frame(&mut self, index: usize) -> eyre::Result<Vec<Variable>> {
        if !self.stack.set_current_index(index).is_empty() {
            self.emit_stack();
        }
        let frame = self
            .stack
            .get(index)
            .cloned()
            .ok_or_else(|| eyre::eyre!("no stack frame at index {index}"))?;

        let scopes: responses::ScopesResponse = self
            .client()?
            .send(RequestBody::Scopes(requests::Scopes { frame_id: frame.id }))
            .wrap_err("fetching scopes")?
            .body_as()?;

        let mut variables = Vec::new();
        for scope in scopes.scopes.iter().filter(|s| !s.expensive) {
            let response: responses::VariablesResponse = self
                .client()?
                .send(RequestBody::Variables(requests::Variables {
                    variables_reference: scope.variables_reference,
                }))
                .wrap_err_with(|| format!("fetching variables for scope {}", scope.name))?
                .body_as()?;
            variables.extend(response.variables);
        }

        self.emit(Event::Variables {
            frame_id: frame.id,
            variables: variables.clone(),
        });
        Ok(variables)
    }

    /// Apply an edit to the breakpoint table, publish it and forward the
    /// affected files to the adapter.
    pub(crate) fn edit_breakpoints(
        &mut self,
        edit: impl FnOnce(&mut Table<Breakpoint>) -> Vec<(TableChange, PathBuf)>,
    ) -> eyre::Result<()> {
        let edits = edit(&mut self.breakpoints);
        if edits.is_empty() {
            return Ok(());
        }
        let (changes, files): (Vec<_>, BTreeSet<_>) = edits.into_iter().unzip();
        self.emit_breakpoints(changes);
        for file in files {
            self.sync_breakpoints(&file)?;
        }
        Ok(())
    }

    /// A continue or step was accepted by the adapter.
    pub(crate) fn on_resumed(&mut self) {
        if self.state != RunState::Stopped {
            return;
        }
        self.clear_stack();
        self.set_state(RunState::Running);
    }

    /// Leave the session, terminating the debuggee or leaving it running.
    pub(crate) fn disconnect(&mut self, terminate_debuggee: bool) {
        match self.state {
            RunState::NoRun => {
                tracing::debug!("no session to end");
                return;
            }
            RunState::Preparing => {}
            RunState::Running | RunState::Stopped => {
                if let Some(client) = self.client.as_ref() {
                    let request = RequestBody::Disconnect(requests::Disconnect {
                        restart: false,
                        terminate_debuggee,
                    });
                    if let Err(e) = client.execute(request) {
                        tracing::warn!(error = %e, "sending disconnect");
                    }
                }
            }
        }
        self.end_session();
    }
}
