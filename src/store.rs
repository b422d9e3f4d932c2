//! Alarm persistence.
//!
//! The list of alarms is plain data owned by the user-facing layer. The
//! delivery engine reads records from it and writes back only the enabled
//! flag (or deletes one-shot records after dismissal).

use crate::alarm::{Alarm, AlarmId};
use crate::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read alarm store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse alarm store: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Alarm not found: {0}")]
    NotFound(AlarmId),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Access to persisted alarm records.
pub trait AlarmStore: Send + Sync {
    fn get(&self, id: &AlarmId) -> Option<Alarm>;

    fn list(&self) -> Vec<Alarm>;

    /// Insert a new record or replace the one with the same id.
    fn upsert(&self, alarm: Alarm) -> Result<(), StoreError>;

    /// Remove a record, returning it if it existed.
    fn remove(&self, id: &AlarmId) -> Result<Option<Alarm>, StoreError>;

    fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<(), StoreError>;
}

/// In-memory store, used when nothing needs to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryAlarmStore {
    alarms: Mutex<Vec<Alarm>>,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alarms(alarms: Vec<Alarm>) -> Self {
        Self {
            alarms: Mutex::new(alarms),
        }
    }

    fn alarms(&self) -> MutexGuard<'_, Vec<Alarm>> {
        self.alarms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AlarmStore for MemoryAlarmStore {
    fn get(&self, id: &AlarmId) -> Option<Alarm> {
        self.alarms().iter().find(|a| &a.id == id).cloned()
    }

    fn list(&self) -> Vec<Alarm> {
        self.alarms().clone()
    }

    fn upsert(&self, alarm: Alarm) -> Result<(), StoreError> {
        upsert_into(&mut self.alarms(), alarm);
        Ok(())
    }

    fn remove(&self, id: &AlarmId) -> Result<Option<Alarm>, StoreError> {
        Ok(remove_from(&mut self.alarms(), id))
    }

    fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<(), StoreError> {
        set_enabled_in(&mut self.alarms(), id, enabled)
    }
}

/// JSON file backed store. Every mutation is written through immediately.
///
/// The file is shared with other processes (the CLI edits it while the
/// daemon runs), so every access re-reads it under the lock and mutations
/// apply to the file as it is on disk now.
#[derive(Debug)]
pub struct JsonAlarmStore {
    path: PathBuf,
    /// Last successfully read contents
    alarms: Mutex<Vec<Alarm>>,
}

fn read_file(path: &Path) -> Result<Vec<Alarm>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&contents)?)
}

impl JsonAlarmStore {
    /// Default location in the data directory.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        Ok(Config::data_dir()?.join("alarms.json"))
    }

    /// Open the store, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let alarms = read_file(&path)?;
        debug!("Loaded {} alarm(s) from {}", alarms.len(), path.display());
        Ok(Self {
            path,
            alarms: Mutex::new(alarms),
        })
    }

    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(Self::default_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock and refresh from disk. An unreadable file keeps the last
    /// known list.
    fn load(&self) -> MutexGuard<'_, Vec<Alarm>> {
        let mut alarms = self.alarms.lock().unwrap_or_else(|e| e.into_inner());
        match read_file(&self.path) {
            Ok(fresh) => *alarms = fresh,
            Err(e) => warn!(
                "Reading {} failed, using last known alarms: {}",
                self.path.display(),
                e
            ),
        }
        alarms
    }

    fn write(&self, alarms: &[Alarm]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, serde_json::to_string_pretty(alarms)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Alarm>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut alarms = self.load();
        let result = f(&mut alarms)?;
        self.write(&alarms)?;
        Ok(result)
    }
}

impl AlarmStore for JsonAlarmStore {
    fn get(&self, id: &AlarmId) -> Option<Alarm> {
        self.load().iter().find(|a| &a.id == id).cloned()
    }

    fn list(&self) -> Vec<Alarm> {
        self.load().clone()
    }

    fn upsert(&self, alarm: Alarm) -> Result<(), StoreError> {
        self.mutate(|alarms| {
            upsert_into(alarms, alarm);
            Ok(())
        })
    }

    fn remove(&self, id: &AlarmId) -> Result<Option<Alarm>, StoreError> {
        let removed = self.mutate(|alarms| Ok(remove_from(alarms, id)))?;
        if removed.is_some() {
            info!("Removed alarm {}", id);
        }
        Ok(removed)
    }

    fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<(), StoreError> {
        self.mutate(|alarms| set_enabled_in(alarms, id, enabled))
    }
}

fn upsert_into(alarms: &mut Vec<Alarm>, alarm: Alarm) {
    match alarms.iter_mut().find(|a| a.id == alarm.id) {
        Some(existing) => *existing = alarm,
        None => alarms.push(alarm),
    }
}

fn remove_from(alarms: &mut Vec<Alarm>, id: &AlarmId) -> Option<Alarm> {
    let pos = alarms.iter().position(|a| &a.id == id)?;
    Some(alarms.remove(pos))
}

fn set_enabled_in(alarms: &mut [Alarm], id: &AlarmId, enabled: bool) -> Result<(), StoreError> {
    let alarm = alarms
        .iter_mut()
        .find(|a| &a.id == id)
        .ok_or_else(|| StoreError::NotFound(id.clone()))?;
    alarm.enabled = enabled;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryAlarmStore::new();
        let alarm = Alarm::new(Utc::now(), "Work", "radar");
        let id = alarm.id.clone();

        store.upsert(alarm.clone()).unwrap();
        assert_eq!(store.get(&id), Some(alarm));

        store.set_enabled(&id, false).unwrap();
        assert!(!store.get(&id).unwrap().enabled);

        assert!(store.remove(&id).unwrap().is_some());
        assert!(store.get(&id).is_none());
        assert!(store.remove(&id).unwrap().is_none());
    }

    #[test]
    fn test_set_enabled_unknown_alarm() {
        let store = MemoryAlarmStore::new();
        let result = store.set_enabled(&AlarmId::from("missing"), true);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let store = MemoryAlarmStore::new();
        let mut alarm = Alarm::new(Utc::now(), "Work", "radar");
        store.upsert(alarm.clone()).unwrap();

        alarm.label = "Gym".to_string();
        store.upsert(alarm.clone()).unwrap();

        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get(&alarm.id).unwrap().label, "Gym");
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");

        let alarm = Alarm::one_shot(Utc::now(), "Nap", "beacon");
        {
            let store = JsonAlarmStore::open(&path).unwrap();
            assert!(store.list().is_empty());
            store.upsert(alarm.clone()).unwrap();
        }

        let reopened = JsonAlarmStore::open(&path).unwrap();
        assert_eq!(reopened.list(), vec![alarm]);
    }

    #[test]
    fn test_json_store_sees_writes_from_other_instance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");

        let daemon = JsonAlarmStore::open(&path).unwrap();
        let cli = JsonAlarmStore::open(&path).unwrap();

        let added = Alarm::new(Utc::now(), "Work", "radar");
        cli.upsert(added.clone()).unwrap();
        assert_eq!(daemon.get(&added.id), Some(added.clone()));

        // A write from the stale instance keeps the other's record
        let snoozed = Alarm::one_shot(Utc::now(), "Work", "radar");
        daemon.upsert(snoozed.clone()).unwrap();
        assert_eq!(cli.list().len(), 2);
        assert_eq!(JsonAlarmStore::open(&path).unwrap().get(&added.id), Some(added.clone()));

        cli.remove(&added.id).unwrap();
        assert_eq!(daemon.list(), vec![snoozed]);
    }

    #[test]
    fn test_json_store_keeps_last_known_on_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        let store = JsonAlarmStore::open(&path).unwrap();
        let alarm = Alarm::new(Utc::now(), "Work", "radar");
        store.upsert(alarm.clone()).unwrap();

        std::fs::write(&path, "{broken").unwrap();
        assert_eq!(store.list(), vec![alarm]);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonAlarmStore::open(&path),
            Err(StoreError::Parse(_))
        ));
    }
}
