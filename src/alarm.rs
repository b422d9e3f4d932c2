//! Alarm records as seen by the delivery engine.

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque unique alarm identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(String);

impl AlarmId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AlarmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AlarmId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single alarm record.
///
/// Owned by the alarm store. The engine only reads it, clears `enabled`
/// when a recurring occurrence completes, and deletes one-shot records
/// once they are dismissed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: AlarmId,
    /// Target wall-clock instant of the next occurrence
    pub time: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Category label shown in notifications
    #[serde(default)]
    pub label: String,
    /// Chosen sound, matched case-insensitively against the catalog
    #[serde(default)]
    pub sound_name: String,
    /// Auto-disable after firing once (one-shot alarm)
    #[serde(default)]
    pub auto_reset: bool,
}

fn default_true() -> bool {
    true
}

impl Alarm {
    /// Create an enabled recurring alarm with a fresh id.
    pub fn new(time: DateTime<Utc>, label: impl Into<String>, sound_name: impl Into<String>) -> Self {
        Self {
            id: AlarmId::generate(),
            time,
            enabled: true,
            label: label.into(),
            sound_name: sound_name.into(),
            auto_reset: false,
        }
    }

    /// Create an enabled one-shot alarm with a fresh id.
    pub fn one_shot(
        time: DateTime<Utc>,
        label: impl Into<String>,
        sound_name: impl Into<String>,
    ) -> Self {
        Self {
            auto_reset: true,
            ..Self::new(time, label, sound_name)
        }
    }

    /// One-shot alarms are deleted on dismissal, recurring ones disabled.
    pub fn is_one_shot(&self) -> bool {
        self.auto_reset
    }

    /// Whether the alarm should currently have a burst scheduled.
    pub fn is_armable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.time > now
    }
}

/// Next local occurrence of a wall-clock time of day, strictly after `now`.
pub fn next_occurrence(time_of_day: NaiveTime, now: DateTime<Local>) -> Option<DateTime<Utc>> {
    let today = now.date_naive().and_time(time_of_day);
    let candidate = Local.from_local_datetime(&today).earliest()?;
    let next = if candidate > now {
        candidate
    } else {
        let tomorrow = now.date_naive().succ_opt()?.and_time(time_of_day);
        Local.from_local_datetime(&tomorrow).earliest()?
    };
    Some(next.with_timezone(&Utc))
}

/// Parse "HH:MM" (24h) into a time of day.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}
