use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use transport::types::{StackFrameId, ThreadId};

use crate::{
    registry::TableChange,
    types::{Breakpoint, OutputLine, StackFrame, Thread, Variable},
};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    #[default]
    NoRun,
    /// Waiting for a build or for the backend to provide a port
    Preparing,
    Running,
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NoRun => "noRun",
            RunState::Preparing => "preparing",
            RunState::Running => "running",
            RunState::Stopped => "stopped",
        }
    }

    /// Whether a debug adapter connection is live
    pub fn is_attached(&self) -> bool {
        matches!(self, RunState::Running | RunState::Stopped)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noRun" => Ok(Self::NoRun),
            "preparing" => Ok(Self::Preparing),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            other => Err(eyre::eyre!("invalid run state {other}")),
        }
    }
}

/// Published by a session to its observers
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RunState(RunState),
    Breakpoints {
        breakpoints: Vec<Breakpoint>,
        changes: Vec<TableChange>,
    },
    Threads {
        threads: Vec<Thread>,
        current: usize,
    },
    Stack {
        thread_id: ThreadId,
        frames: Vec<StackFrame>,
        current: usize,
        can_expand: bool,
    },
    Variables {
        frame_id: StackFrameId,
        variables: Vec<Variable>,
    },
    Output(OutputLine),
    Error(String),
}
