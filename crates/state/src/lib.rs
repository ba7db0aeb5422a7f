//! Breakpoints persisted between adapter runs.

use std::{
    collections::BTreeMap,
    io::Read,
    io::Write,
    path::{Path, PathBuf},
};

use debugger::Breakpoint;
use eyre::Context;
use serde::{Deserialize, Serialize};

pub const STATE_VERSION: &str = "1";

pub struct StateManager {
    save_path: PathBuf,
    current: Persistence,
}

impl StateManager {
    /// Open the state file at `path`, creating it when it cannot be read.
    pub fn new(path: impl Into<PathBuf>) -> eyre::Result<Self> {
        let path = path.into();
        let span = tracing::debug_span!("StateManager", state_path = %path.display());
        let _guard = span.enter();

        tracing::debug!("attempting to load state");
        match crate::load_from(&path) {
            Ok(state) => {
                tracing::debug!(files = state.files.len(), "state loaded");
                Ok(Self {
                    save_path: path,
                    current: state,
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "state unreadable, starting afresh");
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).wrap_err("creating state directory")?;
                }
                let state = Persistence::default();
                crate::save_to(&state, &path).wrap_err("saving state file")?;

                Ok(Self {
                    save_path: path,
                    current: state,
                })
            }
        }
    }

    pub fn load(mut self) -> eyre::Result<Self> {
        let state = crate::load_from(&self.save_path).wrap_err("loading state")?;
        self.current = state;
        Ok(self)
    }

    pub fn save(&self) -> eyre::Result<()> {
        crate::save_to(&self.current, &self.save_path).wrap_err("saving state")
    }

    pub fn current(&self) -> &Persistence {
        &self.current
    }

    pub fn path(&self) -> &Path {
        &self.save_path
    }

    /// Every saved breakpoint, file by file
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.current
            .files
            .iter()
            .flat_map(|file| file.breakpoints.iter().cloned())
            .collect()
    }

    /// Replace the saved breakpoints; call [`StateManager::save`] to write
    /// them out.
    pub fn set_breakpoints(&mut self, breakpoints: &[Breakpoint]) {
        let mut files: BTreeMap<PathBuf, Vec<Breakpoint>> = BTreeMap::new();
        for bp in breakpoints {
            files
                .entry(bp.file_path.clone())
                .or_default()
                .push(bp.clone());
        }
        self.current.files = files
            .into_iter()
            .map(|(path, mut breakpoints)| {
                breakpoints.sort_by_key(|bp| bp.line);
                PerFile { path, breakpoints }
            })
            .collect();
    }
}

/// State that is persisted
#[derive(Serialize, Deserialize, Debug)]
pub struct Persistence {
    #[serde(default)]
    pub files: Vec<PerFile>,
    pub version: String,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            version: STATE_VERSION.to_string(),
        }
    }
}

/// State that is persisted per file
#[derive(Default, Serialize, Deserialize, Debug)]
pub struct PerFile {
    pub path: PathBuf,
    pub breakpoints: Vec<Breakpoint>,
}

pub fn save(state: &Persistence, writer: impl Write) -> eyre::Result<()> {
    serde_json::to_writer_pretty(writer, state).context("saving debugger state")?;
    Ok(())
}

pub fn save_to(state: &Persistence, path: impl AsRef<Path>) -> eyre::Result<()> {
    let f = std::fs::File::create(path).context("creating file for saving")?;
    save(state, &f).context("saving state")?;
    Ok(())
}

pub fn load(reader: impl Read) -> eyre::Result<Persistence> {
    let st = serde_json::from_reader(reader).context("reading debugger state")?;
    Ok(st)
}

pub fn load_from(path: impl AsRef<Path>) -> eyre::Result<Persistence> {
    let path = path.as_ref();
    let f = std::fs::File::open(path)
        .with_context(|| format!("opening save state {}", path.display()))?;
    let state = load(f).context("reading from state file")?;
    Ok(state)
}
