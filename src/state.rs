//! Engine state that must survive a relaunch.
//!
//! If the process is killed while an alarm fires, the next launch reads the
//! firing alarm id from here and puts the alarm back in front of the user.

use crate::alarm::AlarmId;
use crate::config::Config;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Alarm that was firing (or awaiting dismissal) when last written
    #[serde(default)]
    pub firing_alarm_id: Option<AlarmId>,

    #[serde(default)]
    pub last_foreground: Option<DateTime<Utc>>,
}

/// Write-through holder of [`PersistedState`].
#[derive(Debug)]
pub struct StateFile {
    path: Option<PathBuf>,
    state: Mutex<PersistedState>,
}

impl StateFile {
    pub fn default_path() -> Result<PathBuf, StateError> {
        Ok(Config::data_dir()?.join("state.json"))
    }

    /// Load from `path`. A missing or unreadable file yields empty state.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Ignoring corrupt state file {}: {}", path.display(), e);
                PersistedState::default()
            }),
            Err(_) => PersistedState::default(),
        };
        Self {
            path: Some(path),
            state: Mutex::new(state),
        }
    }

    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(PersistedState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `f` and write the result through.
    pub fn update(&self, f: impl FnOnce(&mut PersistedState)) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.clone();
        f(&mut state);
        if *state == before {
            return Ok(());
        }
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&*state)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn set_firing(&self, alarm_id: Option<AlarmId>) -> Result<(), StateError> {
        self.update(|s| s.firing_alarm_id = alarm_id)
    }

    pub fn record_foreground(&self, at: DateTime<Utc>) -> Result<(), StateError> {
        self.update(|s| s.last_foreground = Some(at))
    }
}
