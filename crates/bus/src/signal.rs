//! Bus signals and their positional wire form
//!
//! On the wire every signal is `{"signal": <name>, "args": [...]}`. Argument
//! positions are fixed per signal; optional trailing arguments may be left
//! out.
use std::path::PathBuf;

use debugger::{Breakpoint, DebugTarget, RunState, StackFrame, Thread, Variable};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use server::{DapEndpoint, JavaTarget, JavaToolchain, OutputStream, PortRequest};

pub const LAUNCH_JAVA_DAP: &str = "launch_java_dap";
pub const LAUNCH_PYTHON_DAP: &str = "launch_python_dap";
pub const DAP_PORT: &str = "dapport";
pub const OUTPUT: &str = "output";
pub const GET_DEBUG_PORT: &str = "getDebugPort";
pub const COMMAND: &str = "command";
pub const RUN_STATE: &str = "run_state";
pub const BREAKPOINTS: &str = "breakpoints";
pub const THREADS: &str = "threads";
pub const STACK: &str = "stack";
pub const VARIABLES: &str = "variables";

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("unknown signal {0}")]
    UnknownSignal(String),

    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("{signal}: missing argument {index}")]
    MissingArgument { signal: String, index: usize },

    #[error("{signal}: invalid argument {index}: {source}")]
    InvalidArgument {
        signal: String,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// A signal as framed on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignal {
    pub signal: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Ask the Java bridge for a debug port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JavaLaunch {
    pub session_id: String,
    pub workspace: PathBuf,
    pub trigger_file: Option<PathBuf>,
    pub toolchain: JavaToolchain,
}

impl From<JavaLaunch> for PortRequest {
    fn from(launch: JavaLaunch) -> Self {
        PortRequest {
            session_id: launch.session_id,
            project_path: launch.workspace,
            target: launch.trigger_file,
            arguments: Vec::new(),
            java: Some(launch.toolchain),
        }
    }
}

/// Ask the Python bridge to start a script under debugpy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PythonLaunch {
    pub session_id: String,
    pub project_path: PathBuf,
    pub script: PathBuf,
    pub arguments: Vec<String>,
}

impl From<PythonLaunch> for PortRequest {
    fn from(launch: PythonLaunch) -> Self {
        PortRequest {
            session_id: launch.session_id,
            project_path: launch.project_path,
            target: Some(launch.script),
            arguments: launch.arguments,
            java: None,
        }
    }
}

/// Session operations requested by a front-end
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetProject(DebugTarget),
    Start,
    Restart,
    Abort,
    Detach,
    Interrupt,
    Continue,
    StepOver,
    StepIn,
    StepOut,
    BuildFinished(bool),
    SelectThread(i64),
    SelectFrame(usize),
    AddBreakpoint {
        file: PathBuf,
        line: usize,
    },
    RemoveBreakpoint {
        file: PathBuf,
        line: usize,
    },
    SetBreakpointEnabled {
        file: PathBuf,
        line: usize,
        enabled: bool,
    },
    SetBreakpointCondition {
        file: PathBuf,
        line: usize,
        condition: Option<String>,
    },
    SetAllBreakpointsEnabled(bool),
    RemoveBreakpointsInFile(PathBuf),
    /// Post-mortem session over `core`, produced by executable `target`
    Coredump {
        target: PathBuf,
        core: PathBuf,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetProject(_) => "setProject",
            Command::Start => "start",
            Command::Restart => "restart",
            Command::Abort => "abort",
            Command::Detach => "detach",
            Command::Interrupt => "interrupt",
            Command::Continue => "continue",
            Command::StepOver => "stepOver",
            Command::StepIn => "stepIn",
            Command::StepOut => "stepOut",
            Command::BuildFinished(_) => "buildFinished",
            Command::SelectThread(_) => "selectThread",
            Command::SelectFrame(_) => "selectFrame",
            Command::AddBreakpoint { .. } => "addBreakpoint",
            Command::RemoveBreakpoint { .. } => "removeBreakpoint",
            Command::SetBreakpointEnabled { .. } => "setBreakpointEnabled",
            Command::SetBreakpointCondition { .. } => "setBreakpointCondition",
            Command::SetAllBreakpointsEnabled(_) => "setAllBreakpointsEnabled",
            Command::RemoveBreakpointsInFile(_) => "removeBreakpointsInFile",
            Command::Coredump { .. } => "coredump",
        }
    }

    fn args(&self) -> Vec<Value> {
        let mut args = vec![json!(self.name())];
        match self {
            Command::SetProject(target) => args.push(json!(target)),
            Command::BuildFinished(success) => args.push(json!(success)),
            Command::SelectThread(id) => args.push(json!(id)),
            Command::SelectFrame(index) => args.push(json!(index)),
            Command::AddBreakpoint { file, line } | Command::RemoveBreakpoint { file, line } => {
                args.extend([json!(file), json!(line)])
            }
            Command::SetBreakpointEnabled {
                file,
                line,
                enabled,
            } => args.extend([json!(file), json!(line), json!(enabled)]),
            Command::SetBreakpointCondition {
                file,
                line,
                condition,
            } => args.extend([json!(file), json!(line), json!(condition)]),
            Command::SetAllBreakpointsEnabled(enabled) => args.push(json!(enabled)),
            Command::RemoveBreakpointsInFile(file) => args.push(json!(file)),
            Command::Coredump { target, core } => args.extend([json!(target), json!(core)]),
            Command::Start
            | Command::Restart
            | Command::Abort
            | Command::Detach
            | Command::Interrupt
            | Command::Continue
            | Command::StepOver
            | Command::StepIn
            | Command::StepOut => {}
        }
        args
    }

    fn parse(args: &mut Args) -> Result<Self, SignalError> {
        let name: String = args.next()?;
        let command = match name.as_str() {
            "setProject" => Command::SetProject(args.next()?),
            "start" => Command::Start,
            "restart" => Command::Restart,
            "abort" => Command::Abort,
            "detach" => Command::Detach,
            "interrupt" => Command::Interrupt,
            "continue" => Command::Continue,
            "stepOver" => Command::StepOver,
            "stepIn" => Command::StepIn,
            "stepOut" => Command::StepOut,
            "buildFinished" => Command::BuildFinished(args.next()?),
            "selectThread" => Command::SelectThread(args.next()?),
            "selectFrame" => Command::SelectFrame(args.next()?),
            "addBreakpoint" => Command::AddBreakpoint {
                file: args.next()?,
                line: args.next()?,
            },
            "removeBreakpoint" => Command::RemoveBreakpoint {
                file: args.next()?,
                line: args.next()?,
            },
            "setBreakpointEnabled" => Command::SetBreakpointEnabled {
                file: args.next()?,
                line: args.next()?,
                enabled: args.next()?,
            },
            "setBreakpointCondition" => Command::SetBreakpointCondition {
                file: args.next()?,
                line: args.next()?,
                condition: args.optional::<Option<String>>()?.flatten(),
            },
            "setAllBreakpointsEnabled" => Command::SetAllBreakpointsEnabled(args.next()?),
            "removeBreakpointsInFile" => Command::RemoveBreakpointsInFile(args.next()?),
            "coredump" => Command::Coredump {
                target: args.next()?,
                core: args.next()?,
            },
            other => return Err(SignalError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

/// Everything that crosses the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawSignal", try_from = "RawSignal")]
pub enum Signal {
    LaunchJavaDap(JavaLaunch),
    LaunchPythonDap(PythonLaunch),
    /// A debug adapter is listening for a session
    DapPort(DapEndpoint),
    Output {
        stream: OutputStream,
        text: String,
    },
    /// Ask for the native adapter's port
    GetDebugPort {
        session_id: String,
    },
    Command(Command),
    RunState(RunState),
    /// The whole breakpoint table, sent after every change
    Breakpoints(Vec<Breakpoint>),
    Threads {
        threads: Vec<Thread>,
        current: usize,
    },
    Stack {
        thread_id: i64,
        frames: Vec<StackFrame>,
        current: usize,
        /// More frames exist than were fetched
        can_expand: bool,
    },
    /// Variables in the scopes of the selected frame
    Variables {
        frame_id: i64,
        variables: Vec<Variable>,
    },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::LaunchJavaDap(_) => LAUNCH_JAVA_DAP,
            Signal::LaunchPythonDap(_) => LAUNCH_PYTHON_DAP,
            Signal::DapPort(_) => DAP_PORT,
            Signal::Output { .. } => OUTPUT,
            Signal::GetDebugPort { .. } => GET_DEBUG_PORT,
            Signal::Command(_) => COMMAND,
            Signal::RunState(_) => RUN_STATE,
            Signal::Breakpoints(_) => BREAKPOINTS,
            Signal::Threads { .. } => THREADS,
            Signal::Stack { .. } => STACK,
            Signal::Variables { .. } => VARIABLES,
        }
    }
}

impl From<Signal> for RawSignal {
    fn from(signal: Signal) -> Self {
        let name = signal.name().to_string();
        let args = match signal {
            Signal::LaunchJavaDap(launch) => {
                let tc = launch.toolchain;
                vec![
                    json!(launch.session_id),
                    json!(launch.workspace),
                    json!(launch.trigger_file.unwrap_or_default()),
                    json!(tc.config_home),
                    json!(tc.jre_path),
                    json!(tc.jre_execute),
                    json!(tc.launch_package_file),
                    json!(tc.launch_config_path),
                    json!(tc.dap_package_file),
                ]
            }
            Signal::LaunchPythonDap(launch) => vec![
                json!(launch.session_id),
                json!(launch.project_path),
                json!(launch.script),
                json!(launch.arguments),
            ],
            Signal::DapPort(endpoint) => {
                let mut params = json!({ "projectPath": endpoint.project_path });
                if let Some(java) = endpoint.java {
                    params["workspace"] = json!(java.workspace);
                    params["mainClass"] = json!(java.main_class);
                    params["projectName"] = json!(java.project_name);
                    params["classPaths"] = json!(java.class_paths);
                }
                vec![
                    json!(endpoint.session_id),
                    json!(endpoint.port),
                    json!(endpoint.kit),
                    params,
                ]
            }
            Signal::Output { stream, text } => vec![json!(stream.as_str()), json!(text)],
            Signal::GetDebugPort { session_id } => vec![json!(session_id)],
            Signal::Command(command) => command.args(),
            Signal::RunState(state) => vec![json!(state.as_str())],
            Signal::Breakpoints(breakpoints) => {
                let verified: Vec<bool> = breakpoints.iter().map(|bp| bp.verified).collect();
                vec![json!(breakpoints), json!(verified)]
            }
            Signal::Threads { threads, current } => vec![json!(threads), json!(current)],
            Signal::Stack {
                thread_id,
                frames,
                current,
                can_expand,
            } => vec![
                json!(thread_id),
                json!(frames),
                json!(current),
                json!(can_expand),
            ],
            Signal::Variables {
                frame_id,
                variables,
            } => vec![json!(frame_id), json!(variables)],
        };
        RawSignal { signal: name, args }
    }
}

impl TryFrom<RawSignal> for Signal {
    type Error = SignalError;

    fn try_from(raw: RawSignal) -> Result<Self, Self::Error> {
        let mut args = Args::new(&raw);
        let signal = match raw.signal.as_str() {
            LAUNCH_JAVA_DAP => {
                let session_id = args.next()?;
                let workspace = args.next()?;
                let trigger_file: PathBuf = args.next()?;
                Signal::LaunchJavaDap(JavaLaunch {
                    session_id,
                    workspace,
                    trigger_file: (!trigger_file.as_os_str().is_empty()).then_some(trigger_file),
                    toolchain: JavaToolchain {
                        config_home: args.next()?,
                        jre_path: args.next()?,
                        jre_execute: args.next()?,
                        launch_package_file: args.next()?,
                        launch_config_path: args.next()?,
                        dap_package_file: args.next()?,
                    },
                })
            }
            LAUNCH_PYTHON_DAP => Signal::LaunchPythonDap(PythonLaunch {
                session_id: args.next()?,
                project_path: args.next()?,
                script: args.next()?,
                arguments: args.optional()?.unwrap_or_default(),
            }),
            DAP_PORT => {
                let session_id = args.next()?;
                let port = args.next()?;
                let kit = args.next()?;
                let params: DapPortParams = args.optional()?.unwrap_or_default();
                let java = params.main_class.map(|main_class| JavaTarget {
                    workspace: params
                        .workspace
                        .clone()
                        .unwrap_or_else(|| params.project_path.clone()),
                    main_class,
                    project_name: params.project_name.unwrap_or_default(),
                    class_paths: params.class_paths,
                });
                Signal::DapPort(DapEndpoint {
                    session_id,
                    kit,
                    port,
                    project_path: params.project_path,
                    java,
                })
            }
            OUTPUT => {
                let stream: String = args.next()?;
                Signal::Output {
                    // unknown streams are shown as adapter messages
                    stream: stream.parse().unwrap_or(OutputStream::Normal),
                    text: args.next()?,
                }
            }
            GET_DEBUG_PORT => Signal::GetDebugPort {
                session_id: args.optional()?.unwrap_or_default(),
            },
            COMMAND => Signal::Command(Command::parse(&mut args)?),
            RUN_STATE => {
                let state: String = args.next()?;
                Signal::RunState(state.parse().map_err(|_| SignalError::InvalidArgument {
                    signal: raw.signal.clone(),
                    index: 0,
                    source: <serde_json::Error as serde::de::Error>::custom(format!(
                        "invalid run state {state}"
                    )),
                })?)
            }
            BREAKPOINTS => {
                let mut breakpoints: Vec<Breakpoint> = args.next()?;
                let verified: Vec<bool> = args.optional()?.unwrap_or_default();
                for (bp, verified) in breakpoints.iter_mut().zip(verified) {
                    bp.verified = verified;
                }
                Signal::Breakpoints(breakpoints)
            }
            THREADS => Signal::Threads {
                threads: args.next()?,
                current: args.optional()?.unwrap_or_default(),
            },
            STACK => Signal::Stack {
                thread_id: args.next()?,
                frames: args.next()?,
                current: args.optional()?.unwrap_or_default(),
                can_expand: args.optional()?.unwrap_or_default(),
            },
            VARIABLES => Signal::Variables {
                frame_id: args.next()?,
                variables: args.next()?,
            },
            other => return Err(SignalError::UnknownSignal(other.to_string())),
        };
        Ok(signal)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DapPortParams {
    project_path: PathBuf,
    workspace: Option<PathBuf>,
    main_class: Option<String>,
    project_name: Option<String>,
    class_paths: Vec<String>,
}

/// Cursor over positional arguments
struct Args<'a> {
    signal: &'a str,
    values: &'a [Value],
    index: usize,
}

impl<'a> Args<'a> {
    fn new(raw: &'a RawSignal) -> Self {
        Self {
            signal: &raw.signal,
            values: &raw.args,
            index: 0,
        }
    }

    fn next<T: DeserializeOwned>(&mut self) -> Result<T, SignalError> {
        self.optional()?.ok_or_else(|| SignalError::MissingArgument {
            signal: self.signal.to_string(),
            index: self.index,
        })
    }

    fn optional<T: DeserializeOwned>(&mut self) -> Result<Option<T>, SignalError> {
        let Some(value) = self.values.get(self.index) else {
            return Ok(None);
        };
        let index = self.index;
        self.index += 1;
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| SignalError::InvalidArgument {
                signal: self.signal.to_string(),
                index,
                source,
            })
    }
}
