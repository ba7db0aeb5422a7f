use std::{
    io::{BufRead, BufReader, Read},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use eyre::WrapErr;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};

use crate::{BridgeEvent, OutputStream};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A backend process owned by a bridge
///
/// Output lines are forwarded as [`BridgeEvent::Output`], an unexpected exit
/// is reported as [`BridgeEvent::Exited`], and the process is terminated when
/// the handle is dropped.
pub struct ManagedChild {
    child: Arc<Mutex<Child>>,
    pid: u32,
    session_id: Arc<Mutex<String>>,
    terminating: Arc<AtomicBool>,
}

impl ManagedChild {
    /// Spawn with stdout and stderr forwarded as output.
    pub fn spawn(
        command: &mut Command,
        kit: &'static str,
        session_id: &str,
        events: Sender<BridgeEvent>,
    ) -> eyre::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("spawning {kit} backend {:?}", command.get_program()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let managed = Self::manage(child, kit, session_id, events.clone());
        if let Some(stdout) = stdout {
            managed.pump_lines(stdout, OutputStream::Stdout, events.clone());
        }
        if let Some(stderr) = stderr {
            managed.pump_lines(stderr, OutputStream::Stderr, events);
        }
        Ok(managed)
    }

    /// Spawn with piped stdin and stdout handed back to the caller, for
    /// backends that speak a protocol over stdio. Stderr is forwarded.
    pub fn spawn_stdio(
        command: &mut Command,
        kit: &'static str,
        session_id: &str,
        events: Sender<BridgeEvent>,
    ) -> eyre::Result<(Self, ChildStdin, ChildStdout)> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("spawning {kit} backend {:?}", command.get_program()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| eyre::eyre!("{kit} backend has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre::eyre!("{kit} backend has no stdout"))?;
        let stderr = child.stderr.take();

        let managed = Self::manage(child, kit, session_id, events.clone());
        if let Some(stderr) = stderr {
            managed.pump_lines(stderr, OutputStream::Stderr, events);
        }
        Ok((managed, stdin, stdout))
    }

    fn manage(
        child: Child,
        kit: &'static str,
        session_id: &str,
        events: Sender<BridgeEvent>,
    ) -> Self {
        let pid = child.id();
        tracing::debug!(%pid, %kit, "backend process started");
        let managed = Self {
            child: Arc::new(Mutex::new(child)),
            pid,
            session_id: Arc::new(Mutex::new(session_id.to_string())),
            terminating: Arc::new(AtomicBool::new(false)),
        };
        managed.watch_exit(kit, events);
        managed
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Attribute future output and exit events to another session.
    pub fn set_session(&self, session_id: &str) {
        if let Ok(mut current) = self.session_id.lock() {
            *current = session_id.to_string();
        }
    }

    /// Exit status if the process has finished
    pub fn try_status(&mut self) -> Option<String> {
        let mut child = self.child.lock().ok()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown status: {e}")),
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.try_status().is_none()
    }

    /// Ask the process to stop, killing it if it does not exit promptly.
    pub fn terminate(&mut self) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        tracing::debug!(pid = %self.pid, "terminating backend process");
        if let Err(e) = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            tracing::warn!(error = %e, "could not signal backend process");
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(%status, "backend process terminated");
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(20)),
                Err(_) => break,
            }
        }

        match child.kill() {
            Ok(_) => {
                let _ = child.wait();
                tracing::debug!("backend process killed");
            }
            Err(e) => tracing::warn!(error = %e, "could not kill backend process"),
        }
    }

    fn pump_lines(
        &self,
        reader: impl Read + Send + 'static,
        stream: OutputStream,
        events: Sender<BridgeEvent>,
    ) {
        let session_id = Arc::clone(&self.session_id);
        thread::spawn(move || {
            for line in BufReader::new(reader).lines() {
                let Ok(text) = line else {
                    break;
                };
                let session_id = current(&session_id);
                if events
                    .send(BridgeEvent::Output {
                        session_id,
                        stream,
                        text,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn watch_exit(&self, kit: &'static str, events: Sender<BridgeEvent>) {
        let child = Arc::clone(&self.child);
        let session_id = Arc::clone(&self.session_id);
        let terminating = Arc::clone(&self.terminating);
        thread::spawn(move || {
            loop {
                thread::sleep(EXIT_POLL_INTERVAL);
                if terminating.load(Ordering::SeqCst) {
                    return;
                }
                // try_lock so that a terminate in progress is never blocked
                let status = match child.try_lock() {
                    Ok(mut child) => child.try_wait(),
                    Err(_) => continue,
                };
                match status {
                    Ok(Some(status)) => {
                        if terminating.load(Ordering::SeqCst) {
                            return;
                        }
                        tracing::info!(%kit, %status, "backend process exited");
                        let _ = events.send(BridgeEvent::Exited {
                            session_id: current(&session_id),
                            kit: kit.to_string(),
                            code: status.code(),
                        });
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "could not poll backend process");
                        return;
                    }
                }
            }
        });
    }
}

fn current(session_id: &Mutex<String>) -> String {
    session_id.lock().map(|s| s.clone()).unwrap_or_default()
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        self.terminate();
    }
}
