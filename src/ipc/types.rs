//! IPC message types for daemon communication.

use crate::alarm::AlarmId;
use crate::engine::{DismissOutcome, EngineStatus, ReconcileOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Commands sent from the CLI to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Get daemon and engine status.
    Status,

    /// Stop the daemon.
    Stop,

    /// Ping (for connection health check).
    Ping,

    /// Alarm created, enabled or edited: reload it from the store and arm it.
    Arm { alarm_id: AlarmId },

    /// Alarm disabled or removed: cancel its pending burst.
    Disarm { alarm_id: AlarmId },

    /// Start an alarm right away.
    Test { alarm_id: AlarmId },

    /// The user opened the firing alarm. Defaults to the current one.
    Open {
        #[serde(default)]
        alarm_id: Option<AlarmId>,
    },

    /// Dismiss the firing alarm. Defaults to the current one.
    Dismiss {
        #[serde(default)]
        alarm_id: Option<AlarmId>,
    },

    /// Snooze the firing alarm. Defaults to the current one.
    Snooze {
        #[serde(default)]
        alarm_id: Option<AlarmId>,
    },

    /// The user brought the app to the foreground.
    Foreground,
}

/// Response from daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<IpcResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response data variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcResponseData {
    Status(DaemonStatus),
    Snoozed {
        alarm_id: AlarmId,
        until: DateTime<Utc>,
    },
    Dismissed {
        outcome: DismissOutcome,
    },
    Reconciled {
        reconcile: ReconcileOutcome,
    },
    Armed {
        armed: bool,
    },
    Pong {
        timestamp: u64,
    },
    Empty {},
}

/// Daemon status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    /// Daemon version.
    pub version: String,
    pub engine: EngineStatus,
}

impl IpcResponse {
    pub fn ok() -> Self {
        Self::with_data(IpcResponseData::Empty {})
    }

    fn with_data(data: IpcResponseData) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn status(engine: EngineStatus) -> Self {
        Self::with_data(IpcResponseData::Status(DaemonStatus {
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            engine,
        }))
    }

    pub fn dismissed(outcome: DismissOutcome) -> Self {
        Self::with_data(IpcResponseData::Dismissed { outcome })
    }

    pub fn snoozed(alarm_id: AlarmId, until: DateTime<Utc>) -> Self {
        Self::with_data(IpcResponseData::Snoozed { alarm_id, until })
    }

    pub fn reconciled(reconcile: ReconcileOutcome) -> Self {
        Self::with_data(IpcResponseData::Reconciled { reconcile })
    }

    pub fn armed(armed: bool) -> Self {
        Self::with_data(IpcResponseData::Armed { armed })
    }

    pub fn pong() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::with_data(IpcResponseData::Pong { timestamp })
    }

    pub fn error(msg: &str) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.to_string()),
        }
    }
}
