//! Adapter settings
//!
//! Settings are read from `<config dir>/debugadapter/config.toml`. Every
//! field has a default, so a missing file or a partial file is fine.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use server::{JavaSettings, NativeSettings, PythonSettings};

pub const APP_NAME: &str = "debugadapter";
pub const DEFAULT_BUS_ADDRESS: &str = "127.0.0.1:47100";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where front-ends reach the bus
    pub bus_address: String,
    /// How long a debug adapter request may stay unanswered
    #[serde(with = "server::millis")]
    pub request_timeout: Duration,
    /// Breakpoints saved between runs; defaults to the local data directory
    pub state_file: Option<PathBuf>,
    pub native: NativeSettings,
    pub java: JavaSettings,
    pub python: PythonSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus_address: DEFAULT_BUS_ADDRESS.to_string(),
            request_timeout: Duration::from_secs(30),
            state_file: None,
            native: NativeSettings::default(),
            java: JavaSettings::default(),
            python: PythonSettings::default(),
        }
    }
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
    }

    /// Load from `path`, or from the default location when none is given.
    ///
    /// An explicit path has to exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> eyre::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::load_from(&path),
                other => {
                    tracing::debug!(path = ?other, "no config file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading settings");
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn to_toml(&self) -> eyre::Result<String> {
        toml::to_string_pretty(self).wrap_err("serialising settings")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_NAME)
                .join("state.json")
        })
    }
}
