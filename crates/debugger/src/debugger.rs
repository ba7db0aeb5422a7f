use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use eyre::WrapErr;
use server::{BackendRegistry, DapEndpoint, OutputStream};
use transport::{
    Client, DEFAULT_REQUEST_TIMEOUT, events,
    message::Response,
    requests::{self, Initialize, RequestBody},
    types::ThreadId,
};
use uuid::Uuid;

use crate::{
    Event, RunState,
    internals::DebuggerInternals,
    project::{DebugTarget, ProjectContext},
    registry::TableChange,
    types::{Breakpoint, OutputLine, StackFrame, Thread, Variable},
};

/// DAP adapter id announced in `initialize` for each backend kit
fn adapter_id(kit: &str) -> &str {
    match kit {
        server::native::KIT => "cppdbg",
        server::python::KIT => "debugpy",
        other => other,
    }
}

/// One debugging session at a time
///
/// Operations are synchronous; adapter events are handled on a background
/// thread and published, together with every state change, on the channel
/// returned by [`Debugger::events`].
pub struct Debugger {
    internals: Arc<Mutex<DebuggerInternals>>,
    rx: crossbeam_channel::Receiver<Event>,
    request_timeout: Duration,
}

impl Debugger {
    pub fn new(backends: Arc<Mutex<BackendRegistry>>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            internals: Arc::new(Mutex::new(DebuggerInternals::new(tx, backends))),
            rx,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Change how long adapter requests may take.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn events(&self) -> crossbeam_channel::Receiver<Event> {
        self.rx.clone()
    }

    /// Replace the project debugged by the next session.
    pub fn set_project(&self, project: Box<dyn ProjectContext>) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.project = Some(project);
            Ok(())
        })
    }

    pub fn run_state(&self) -> eyre::Result<RunState> {
        self.with_internals(|internals| Ok(internals.state))
    }

    /// Id of the session being prepared or debugged
    pub fn session_id(&self) -> eyre::Result<Option<String>> {
        self.with_internals(|internals| Ok(internals.session_id.clone()))
    }

    pub fn breakpoints(&self) -> eyre::Result<Vec<Breakpoint>> {
        self.with_internals(|internals| Ok(internals.breakpoints.rows().to_vec()))
    }

    pub fn threads(&self) -> eyre::Result<Vec<Thread>> {
        self.with_internals(|internals| Ok(internals.threads.rows().to_vec()))
    }

    pub fn stack(&self) -> eyre::Result<Vec<StackFrame>> {
        self.with_internals(|internals| Ok(internals.stack.rows().to_vec()))
    }

    #[tracing::instrument(skip(self))]
    pub fn start_debug(&self) -> eyre::Result<()> {
        self.with_internals(|internals| internals.start_debug())
    }

    /// Inspect `core`, dumped by the executable `target`, under the native
    /// backend. The coredump becomes the active project.
    #[tracing::instrument(skip(self, debugger_path))]
    pub fn run_coredump(
        &self,
        target: &Path,
        core: &Path,
        debugger_path: Option<String>,
    ) -> eyre::Result<()> {
        self.with_internals(|internals| {
            if internals.state != RunState::NoRun {
                eyre::bail!("a debug session is already {}", internals.state);
            }
            internals.emit(Event::Output(OutputLine::new(
                OutputStream::Normal,
                format!(
                    "start debugging coredump file {} with {}",
                    core.display(),
                    target.display()
                ),
            )));
            for (what, path) in [("coredump target", target), ("coredump file", core)] {
                if !path.is_file() {
                    let error = eyre::eyre!("{what} {} is not a file", path.display());
                    internals.emit(Event::Error(error.to_string()));
                    return Err(error);
                }
            }

            internals.project = Some(Box::new(DebugTarget {
                kit: server::native::KIT.to_string(),
                project_path: target.parent().map(Path::to_path_buf).unwrap_or_default(),
                program: Some(target.to_path_buf()),
                debugger_path,
                core_dump: Some(core.to_path_buf()),
                ..Default::default()
            }));
            internals.start_debug()
        })
    }

    /// Resume a start that was waiting for a build.
    pub fn on_build_finished(&self, success: bool) -> eyre::Result<()> {
        self.with_internals(|internals| internals.on_build_finished(success))
    }

    /// Connect to the adapter a backend made ready for this session.
    #[tracing::instrument(
        skip(self, endpoint),
        fields(session_id = %endpoint.session_id, port = endpoint.port)
    )]
    pub fn on_port_ready(&self, endpoint: &DapEndpoint) -> eyre::Result<()> {
        let prepared = self.with_internals(|internals| {
            if internals.state != RunState::Preparing
                || !internals.is_current_session(&endpoint.session_id)
            {
                tracing::debug!(state = %internals.state, "ignoring port for another session");
                return Ok(None);
            }
            let request = internals
                .project
                .as_ref()
                .ok_or_else(|| eyre::eyre!("no active project to debug"))
                .and_then(|project| project.session_request(endpoint));
            match request {
                Ok(request) => {
                    internals.generation += 1;
                    Ok(Some((internals.generation, request)))
                }
                Err(e) => {
                    internals.fail(&e);
                    Err(e)
                }
            }
        })?;
        let Some((generation, request)) = prepared else {
            return Ok(());
        };

        // connecting retries for a few seconds so the lock is not held
        let (tx, rx) = crossbeam_channel::unbounded();
        let connected = Client::connect(("127.0.0.1", endpoint.port), tx)
            .map(|client| client.with_timeout(self.request_timeout))
            .and_then(|client| {
                let response = client
                    .send(RequestBody::Initialize(Initialize::for_adapter(adapter_id(
                        &endpoint.kit,
                    ))))
                    .wrap_err("initializing debug adapter")?;
                eyre::ensure!(
                    response.success,
                    "debug adapter refused initialize: {}",
                    response.message.as_deref().unwrap_or("no message")
                );
                Ok(client)
            });

        let installed = self.with_internals(|internals| {
            if internals.generation != generation {
                tracing::debug!("session ended while connecting");
                return Ok(None);
            }
            let client = match connected {
                Ok(client) => client,
                Err(e) => {
                    internals.fail(&e);
                    return Err(e);
                }
            };
            let pending = match client.send_async(request).wrap_err("sending launch request") {
                Ok(pending) => pending,
                Err(e) => {
                    internals.fail(&e);
                    return Err(e);
                }
            };
            internals.client = Some(client);
            Ok(Some(pending))
        })?;

        if let Some(pending) = installed {
            self.spawn_event_loop(generation, rx);
            self.watch_launch(generation, pending);
        }
        Ok(())
    }

    /// Fail the session when the adapter refuses the launch or attach
    /// request, or when it is still preparing once the request timeout has
    /// passed.
    fn watch_launch(&self, generation: u64, pending: oneshot::Receiver<Response>) {
        let internals = Arc::clone(&self.internals);
        let timeout = self.request_timeout;
        thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            let refused = match pending.recv_timeout(timeout) {
                Ok(response) if response.success => None,
                Ok(response) => Some(eyre::eyre!(
                    "debug adapter refused {}: {}",
                    response.command,
                    response.message.as_deref().unwrap_or("no message")
                )),
                Err(oneshot::RecvTimeoutError::Timeout) => None,
                Err(oneshot::RecvTimeoutError::Disconnected) => {
                    tracing::debug!("connection closed before launch response");
                    return;
                }
            };
            if refused.is_none() {
                // the response may legitimately follow configurationDone
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
            }

            let mut guard = match internals.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::warn!(error = %e, "debugger mutex poisoned, not checking launch");
                    return;
                }
            };
            if guard.generation != generation {
                return;
            }
            match refused {
                Some(error) => guard.fail(&error),
                None if guard.state == RunState::Preparing => guard.fail(&eyre::eyre!(
                    "debug adapter did not initialize within {timeout:?}"
                )),
                None => {}
            }
        });
    }

    /// A backend could not provide a port.
    pub fn on_backend_failed(&self, session_id: &str, error: &str) -> eyre::Result<()> {
        self.with_internals(|internals| {
            if internals.is_current_session(session_id) && internals.state == RunState::Preparing {
                internals.fail(&eyre::eyre!("{error}"));
            }
            Ok(())
        })
    }

    /// A backend process serving this session went away.
    pub fn on_backend_exited(&self, session_id: &str, code: Option<i32>) -> eyre::Result<()> {
        self.with_internals(|internals| {
            if !internals.is_current_session(session_id) {
                return Ok(());
            }
            let text = match code {
                Some(code) => format!("debug backend exited with code {code}"),
                None => "debug backend was killed".to_string(),
            };
            internals.emit(Event::Output(crate::OutputLine::new(
                server::OutputStream::Normal,
                text,
            )));
            internals.end_session();
            Ok(())
        })
    }

    fn spawn_event_loop(&self, generation: u64, rx: crossbeam_channel::Receiver<events::Event>) {
        let internals = Arc::clone(&self.internals);
        thread::spawn(move || {
            for event in rx.iter() {
                let mut guard = match internals.lock() {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::warn!(error = %e, "debugger mutex poisoned, stopping event loop");
                        return;
                    }
                };
                guard.on_event(generation, event);
                if guard.generation != generation {
                    break;
                }
            }
            tracing::debug!(%generation, "event loop finished");
        });
    }

    #[tracing::instrument(skip(self))]
    pub fn interrupt_debug(&self) -> eyre::Result<()> {
        self.with_internals(|internals| {
            if internals.state != RunState::Running {
                tracing::debug!(state = %internals.state, "not running, ignoring interrupt");
                return Ok(());
            }
            let thread_id = internals.current_thread_id().unwrap_or_default();
            let client = internals
                .client
                .as_ref()
                .ok_or_else(|| eyre::eyre!("not connected to a debug adapter"))?;
            client
                .execute(RequestBody::Pause(requests::Pause { thread_id }))
                .wrap_err("sending pause")
        })
    }

    pub fn continue_debug(&self) -> eyre::Result<()> {
        self.resume("continue", |thread_id| {
            RequestBody::Continue(requests::Continue {
                thread_id,
                single_thread: false,
            })
        })
    }

    pub fn step_over(&self) -> eyre::Result<()> {
        self.resume("next", |thread_id| {
            RequestBody::Next(requests::Next { thread_id })
        })
    }

    pub fn step_in(&self) -> eyre::Result<()> {
        self.resume("stepIn", |thread_id| {
            RequestBody::StepIn(requests::StepIn { thread_id })
        })
    }

    pub fn step_out(&self) -> eyre::Result<()> {
        self.resume("stepOut", |thread_id| {
            RequestBody::StepOut(requests::StepOut { thread_id })
        })
    }

    /// Events that arrive while the request is outstanding wait for the
    /// session lock, so a stop reported before the response still wins.
    #[tracing::instrument(skip(self, body))]
    fn resume(
        &self,
        command: &str,
        body: impl FnOnce(ThreadId) -> RequestBody,
    ) -> eyre::Result<()> {
        self.with_internals(|internals| {
            if internals.state != RunState::Stopped {
                tracing::debug!(state = %internals.state, "not stopped, ignoring");
                return Ok(());
            }
            let thread_id = internals
                .current_thread_id()
                .ok_or_else(|| eyre::eyre!("no current thread"))?;
            let client = internals
                .client
                .as_ref()
                .ok_or_else(|| eyre::eyre!("not connected to a debug adapter"))?;

            let response = client
                .send(body(thread_id))
                .wrap_err_with(|| format!("sending {command}"))?;
            if !response.success {
                let error = eyre::eyre!(
                    "{command} failed: {}",
                    response.message.as_deref().unwrap_or("no message")
                );
                internals.emit(Event::Error(error.to_string()));
                return Err(error);
            }
            internals.on_resumed();
            Ok(())
        })
    }

    /// End the session and terminate the debuggee.
    #[tracing::instrument(skip(self))]
    pub fn abort_debug(&self) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.disconnect(true);
            Ok(())
        })
    }

    /// End the session and leave the debuggee running.
    #[tracing::instrument(skip(self))]
    pub fn detach_debug(&self) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.disconnect(false);
            Ok(())
        })
    }

    pub fn restart_debug(&self) -> eyre::Result<()> {
        self.abort_debug()?;
        self.start_debug()
    }

    /// Make `thread_id` current and show its frames.
    pub fn switch_current_thread(&self, thread_id: ThreadId) -> eyre::Result<()> {
        self.with_internals(|internals| internals.switch_current_thread(thread_id))
    }

    /// Make frame `index` current and return the variables in its scopes.
    pub fn slot_frame_selected(&self, index: usize) -> eyre::Result<Vec<Variable>> {
        self.with_internals(|internals| internals.select_frame(index))
    }

    pub fn slot_breakpoint_selected(&self, index: usize) -> eyre::Result<Option<Breakpoint>> {
        self.with_internals(|internals| {
            let changes = internals.breakpoints.set_current_index(index);
            if !changes.is_empty() {
                internals.emit_breakpoints(changes);
            }
            Ok(internals.breakpoints.get(index).cloned())
        })
    }

    /// Add a breakpoint, or replace the one on the same line.
    #[tracing::instrument(skip(self))]
    pub fn add_breakpoint(&self, breakpoint: Breakpoint) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.edit_breakpoints(|table| {
                let file = breakpoint.file_path.clone();
                vec![(table.insert(breakpoint), file)]
            })
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn remove_breakpoint(&self, file: &Path, line: usize) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.edit_breakpoints(|table| {
                table
                    .remove(&Breakpoint::new(file, line))
                    .map(|change| (change, file.to_path_buf()))
                    .into_iter()
                    .collect()
            })
        })
    }

    pub fn set_breakpoint_condition(
        &self,
        file: &Path,
        line: usize,
        condition: Option<String>,
    ) -> eyre::Result<()> {
        self.update_breakpoint(file, line, |bp| bp.condition = condition)
    }

    pub fn set_breakpoint_enabled(
        &self,
        file: &Path,
        line: usize,
        enabled: bool,
    ) -> eyre::Result<()> {
        self.update_breakpoint(file, line, |bp| bp.enabled = enabled)
    }

    fn update_breakpoint(
        &self,
        file: &Path,
        line: usize,
        f: impl FnOnce(&mut Breakpoint),
    ) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.edit_breakpoints(|table| {
                table
                    .update_with(&Breakpoint::new(file, line), f)
                    .map(|change| (change, file.to_path_buf()))
                    .into_iter()
                    .collect()
            })
        })
    }

    pub fn set_all_breakpoints_enabled(&self, enabled: bool) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.edit_breakpoints(|table| {
                table
                    .iter_mut()
                    .enumerate()
                    .map(|(index, bp)| {
                        bp.enabled = enabled;
                        (TableChange::Updated(index), bp.file_path.clone())
                    })
                    .collect()
            })
        })
    }

    /// Forget every breakpoint in `file`, for instance after it was deleted.
    pub fn remove_breakpoints_in_file(&self, file: &Path) -> eyre::Result<()> {
        self.with_internals(|internals| {
            internals.edit_breakpoints(|table| {
                let doomed: Vec<Breakpoint> =
                    table.iter().filter(|bp| bp.is_in(file)).cloned().collect();
                doomed
                    .iter()
                    .filter_map(|bp| table.remove(bp))
                    .map(|change| (change, file.to_path_buf()))
                    .collect()
            })
        })
    }

    /// Replace every breakpoint, for instance with the ones saved by a
    /// previous run.
    pub fn load_breakpoints(&self, breakpoints: Vec<Breakpoint>) -> eyre::Result<()> {
        self.with_internals(|internals| {
            let mut files: Vec<PathBuf> = internals
                .breakpoints
                .iter()
                .chain(breakpoints.iter())
                .map(|bp| bp.file_path.clone())
                .collect();
            files.sort();
            files.dedup();
            internals.edit_breakpoints(|table| {
                let change = table.set_all(breakpoints, false);
                files.into_iter().map(|file| (change, file)).collect()
            })
        })
    }

    #[tracing::instrument(skip_all, fields(lock_id = Uuid::new_v4().to_string()))]
    fn with_internals<F, T>(&self, f: F) -> eyre::Result<T>
    where
        F: FnOnce(&mut DebuggerInternals) -> eyre::Result<T>,
    {
        tracing::trace!(poisoned = %self.internals.is_poisoned(), "trying to lock internals");
        let mut internals = self
            .internals
            .lock()
            .map_err(|e| eyre::eyre!("debugger mutex poisoned: {}", e))?;
        tracing::trace!("executing operation");
        let res = f(&mut internals);
        drop(internals);
        tracing::trace!("unlocked internals");
        res
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        tracing::debug!("dropping debugger");
        if let Err(e) = self.abort_debug() {
            tracing::warn!(error = %e, "failed to end session during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use server::BackendRegistry;

    use super::*;
    use crate::DebugTarget;

    fn debugger() -> Debugger {
        Debugger::new(Arc::new(Mutex::new(BackendRegistry::new())))
    }

    #[test]
    fn steps_outside_a_stop_are_ignored() {
        let debugger = debugger();
        debugger.step_over().unwrap();
        debugger.continue_debug().unwrap();
        debugger.interrupt_debug().unwrap();
        assert_eq!(debugger.run_state().unwrap(), RunState::NoRun);
        assert!(debugger.events().try_recv().is_err());
    }

    #[test]
    fn start_without_project_reports_error() {
        let debugger = debugger();
        assert!(debugger.start_debug().is_err());
        assert!(matches!(debugger.events().try_recv(), Ok(Event::Error(_))));
        assert_eq!(debugger.run_state().unwrap(), RunState::NoRun);
    }

    #[test]
    fn unknown_kit_stays_in_no_run() {
        let debugger = debugger();
        debugger
            .set_project(Box::new(DebugTarget {
                kit: "cobol".to_string(),
                ..Default::default()
            }))
            .unwrap();
        assert!(debugger.start_debug().is_err());
        assert_eq!(debugger.run_state().unwrap(), RunState::NoRun);
    }

    #[test]
    fn breakpoints_are_staged_without_a_session() {
        let debugger = debugger();
        let events = debugger.events();
        debugger.add_breakpoint(Breakpoint::new("/src/a.c", 3)).unwrap();
        debugger.add_breakpoint(Breakpoint::new("/src/b.c", 7)).unwrap();
        debugger
            .set_breakpoint_condition(Path::new("/src/a.c"), 3, Some("i == 2".into()))
            .unwrap();

        let bps = debugger.breakpoints().unwrap();
        assert_eq!(bps.len(), 2);
        assert_eq!(bps[0].condition.as_deref(), Some("i == 2"));
        assert_eq!(events.try_iter().count(), 3);

        debugger.remove_breakpoints_in_file(Path::new("/src/a.c")).unwrap();
        assert_eq!(debugger.breakpoints().unwrap(), vec![Breakpoint::new("/src/b.c", 7)]);

        // removing a missing breakpoint publishes nothing
        let _ = events.try_iter().count();
        debugger.remove_breakpoint(Path::new("/src/a.c"), 3).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn selecting_a_breakpoint_reports_both_rows() {
        let debugger = debugger();
        debugger
            .load_breakpoints(vec![
                Breakpoint::new("/src/a.c", 1),
                Breakpoint::new("/src/a.c", 2),
            ])
            .unwrap();
        let events = debugger.events();
        let _ = events.try_iter().count();

        let selected = debugger.slot_breakpoint_selected(1).unwrap();
        assert_eq!(selected, Some(Breakpoint::new("/src/a.c", 2)));
        match events.try_recv().unwrap() {
            Event::Breakpoints { changes, .. } => {
                assert_eq!(changes, vec![TableChange::Updated(0), TableChange::Updated(1)]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // selecting the current row again changes nothing
        debugger.slot_breakpoint_selected(1).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn coredump_requires_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app");
        std::fs::write(&target, b"").unwrap();
        let core = dir.path().join("core.1");

        let debugger = debugger();
        let events = debugger.events();
        let error = debugger.run_coredump(&target, &core, None).unwrap_err();
        assert!(error.to_string().contains("coredump file"), "{error}");

        assert!(matches!(
            events.try_recv(),
            Ok(Event::Output(line)) if line.text.contains("start debugging coredump")
        ));
        assert!(matches!(events.try_recv(), Ok(Event::Error(_))));
        assert_eq!(debugger.run_state().unwrap(), RunState::NoRun);
    }

    #[test]
    fn disabling_all_breakpoints_reports_every_row() {
        let debugger = debugger();
        debugger
            .load_breakpoints(vec![
                Breakpoint::new("/src/a.c", 1),
                Breakpoint::new("/src/a.c", 2),
            ])
            .unwrap();
        let events = debugger.events();
        let _ = events.try_iter().count();

        debugger.set_all_breakpoints_enabled(false).unwrap();
        match events.try_recv().unwrap() {
            Event::Breakpoints { breakpoints, changes } => {
                assert!(breakpoints.iter().all(|bp| !bp.enabled));
                assert_eq!(changes, vec![TableChange::Updated(0), TableChange::Updated(1)]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
