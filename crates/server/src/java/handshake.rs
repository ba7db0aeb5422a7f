//! The request sequence that turns a running Java language server into a
//! debug adapter port for one session.
//!
//! [`Handshake`] does no IO: it hands back the requests to write and turns
//! responses into [`Action`]s, so the sequencing can be tested on its own.
use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use serde_json::Value;
use transport::jsonrpc::{RequestId, RequestMessage, ResponseMessage};

use crate::{DapEndpoint, JavaTarget};

use super::KIT;

pub const START_DEBUG_SESSION: &str = "vscode.java.startDebugSession";
pub const RESOLVE_MAIN_CLASS: &str = "vscode.java.resolveMainClass";
pub const RESOLVE_CLASSPATH: &str = "vscode.java.resolveClasspath";

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(RequestMessage),
    Ready(DapEndpoint),
    Failed(String),
}

/// What is needed to start the handshake for one session
#[derive(Debug, Clone)]
pub struct SessionStart {
    pub session_id: String,
    pub workspace: PathBuf,
    /// `initialize` parameters; `None` when the server already has this
    /// workspace open
    pub initialize: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    DapPort,
    MainClass,
    ClassPath,
}

#[derive(Debug)]
struct Session {
    session_id: String,
    workspace: PathBuf,
    pending: HashMap<RequestId, (Pending, Instant)>,
    port: u16,
    main_class: Option<(String, String)>,
    main_class_unresolvable: bool,
    class_paths: Option<Vec<String>>,
}

impl Session {
    fn ready(&self) -> Option<DapEndpoint> {
        if self.port == 0 || (self.class_paths.is_none() && !self.main_class_unresolvable) {
            return None;
        }
        let (main_class, project_name) = self.main_class.clone().unwrap_or_default();
        Some(DapEndpoint {
            session_id: self.session_id.clone(),
            kit: KIT.to_string(),
            port: self.port,
            project_path: self.workspace.clone(),
            java: Some(JavaTarget {
                workspace: self.workspace.clone(),
                main_class,
                project_name,
                class_paths: self.class_paths.clone().unwrap_or_default(),
            }),
        })
    }
}

/// Request sequencing across sessions of one language server process
///
/// Request ids keep increasing for the life of the process. Readiness is
/// reported at most once per session, when the adapter port is known and
/// the classpath has arrived or the main class turned out to be
/// unresolvable.
#[derive(Debug)]
pub struct Handshake {
    next_id: RequestId,
    timeout: Duration,
    session: Option<Session>,
}

impl Handshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: 1,
            timeout,
            session: None,
        }
    }

    fn take_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    /// Start a session, replacing any session still in progress.
    pub fn begin(&mut self, start: SessionStart, now: Instant) -> Vec<RequestMessage> {
        if let Some(old) = self.session.take() {
            tracing::debug!(session_id = %old.session_id, "abandoning unfinished handshake");
        }

        let mut requests = Vec::new();
        if let Some(params) = start.initialize {
            requests.push(RequestMessage::new(self.take_id(), "initialize", params));
            // sent with an id but never waited on
            requests.push(RequestMessage::new(
                self.take_id(),
                "initialized",
                serde_json::json!({}),
            ));
        }

        let mut pending = HashMap::new();
        let dap_id = self.take_id();
        requests.push(RequestMessage::execute_command(
            dap_id,
            START_DEBUG_SESSION,
            Vec::new(),
        ));
        pending.insert(dap_id, (Pending::DapPort, now));

        let main_class_id = self.take_id();
        requests.push(RequestMessage::execute_command(
            main_class_id,
            RESOLVE_MAIN_CLASS,
            Vec::new(),
        ));
        pending.insert(main_class_id, (Pending::MainClass, now));

        tracing::debug!(session_id = %start.session_id, %dap_id, %main_class_id, "starting handshake");
        self.session = Some(Session {
            session_id: start.session_id,
            workspace: start.workspace,
            pending,
            port: 0,
            main_class: None,
            main_class_unresolvable: false,
            class_paths: None,
        });
        requests
    }

    /// Drop the session in progress without reporting anything.
    pub fn cancel(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(session_id = %session.session_id, "handshake cancelled");
        }
    }

    /// Feed a response from the language server.
    ///
    /// Responses to requests that are not pending are ignored.
    pub fn on_response(&mut self, response: &ResponseMessage, now: Instant) -> Vec<Action> {
        let Some(id) = response.id else {
            return Vec::new();
        };
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let Some((kind, _)) = session.pending.remove(&id) else {
            tracing::trace!(%id, "ignoring response");
            return Vec::new();
        };

        let mut actions = Vec::new();
        match kind {
            Pending::DapPort => match port_result(response) {
                Ok(port) => {
                    tracing::info!(%port, "java debug adapter port resolved");
                    session.port = port;
                }
                Err(reason) => {
                    let session_id = session.session_id.clone();
                    self.session = None;
                    tracing::warn!(%session_id, %reason, "debug session could not start");
                    return vec![Action::Failed(reason)];
                }
            },
            Pending::MainClass => match main_class_result(response) {
                Some((main_class, project_name)) => {
                    tracing::debug!(%main_class, %project_name, "main class resolved");
                    let arguments = vec![
                        Value::from(main_class.clone()),
                        Value::from(project_name.clone()),
                    ];
                    session.main_class = Some((main_class, project_name));
                    let id = self.next_id;
                    self.next_id += 1;
                    session.pending.insert(id, (Pending::ClassPath, now));
                    actions.push(Action::Send(RequestMessage::execute_command(
                        id,
                        RESOLVE_CLASSPATH,
                        arguments,
                    )));
                }
                None => {
                    tracing::warn!("main class could not be resolved");
                    session.main_class_unresolvable = true;
                }
            },
            Pending::ClassPath => {
                let class_paths = class_path_result(response).unwrap_or_else(|| {
                    tracing::warn!("classpath could not be resolved");
                    Vec::new()
                });
                session.class_paths = Some(class_paths);
            }
        }

        actions.extend(self.check_ready());
        actions
    }

    /// Give up on requests that have been pending longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Action> {
        let timeout = self.timeout;
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        let expired: Vec<_> = session
            .pending
            .iter()
            .filter(|(_, (_, sent))| now.saturating_duration_since(*sent) >= timeout)
            .map(|(id, (kind, _))| (*id, *kind))
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }

        for (id, kind) in expired {
            session.pending.remove(&id);
            tracing::warn!(%id, ?kind, ?timeout, "language server request timed out");
            match kind {
                Pending::DapPort => {
                    self.session = None;
                    return vec![Action::Failed(format!(
                        "{START_DEBUG_SESSION} timed out after {timeout:?}"
                    ))];
                }
                Pending::MainClass => session.main_class_unresolvable = true,
                Pending::ClassPath => session.class_paths = Some(Vec::new()),
            }
        }
        self.check_ready()
    }

    fn check_ready(&mut self) -> Vec<Action> {
        let Some(endpoint) = self.session.as_ref().and_then(Session::ready) else {
            return Vec::new();
        };
        // readiness ends the session; later responses are ignored
        self.session = None;
        vec![Action::Ready(endpoint)]
    }
}

fn response_error(response: &ResponseMessage) -> Option<String> {
    response
        .error
        .as_ref()
        .map(|e| format!("{} ({})", e.message, e.code))
}

fn port_result(response: &ResponseMessage) -> Result<u16, String> {
    if let Some(error) = response_error(response) {
        return Err(format!("{START_DEBUG_SESSION} failed: {error}"));
    }
    response
        .result
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0)
        .ok_or_else(|| format!("{START_DEBUG_SESSION} returned no port"))
}

fn main_class_result(response: &ResponseMessage) -> Option<(String, String)> {
    let first = response.result.as_ref()?.as_array()?.first()?;
    let main_class = first.get("mainClass")?.as_str()?;
    let project_name = first.get("projectName")?.as_str()?;
    Some((main_class.to_string(), project_name.to_string()))
}

fn class_path_result(response: &ResponseMessage) -> Option<Vec<String>> {
    let paths = response.result.as_ref()?.as_array()?.first()?.as_array()?;
    Some(
        paths
            .iter()
            .filter_map(|p| p.as_str().map(String::from))
            .collect(),
    )
}
