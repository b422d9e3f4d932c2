//! Foreground reconciliation.
//!
//! When the app comes to the foreground and an alarm is waiting for the
//! user to dismiss it, make sure it is actually audible. This covers a
//! relaunch after the process was killed mid-alarm. It never dismisses.

use super::gate::{EngineCore, StartOutcome};
use crate::trigger::TriggerPayload;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    NoAction,
    /// Existing session was made audible again
    Resumed,
    /// A new session was started for a restored alarm
    Restarted,
}

pub fn foreground(core: &mut EngineCore) -> ReconcileOutcome {
    if let Err(e) = core.state.record_foreground(Utc::now()) {
        warn!("Failed to record foreground time: {}", e);
    }

    let Some(alarm_id) = core.lifecycle.awaiting_dismissal().into_iter().next() else {
        debug!("Foreground: nothing awaiting dismissal");
        return ReconcileOutcome::NoAction;
    };

    if core.playback.is_active() {
        return ReconcileOutcome::NoAction;
    }

    let payload = match core.session() {
        Some(session) if session.alarm_id == alarm_id => TriggerPayload {
            alarm_id: alarm_id.clone(),
            label: session.label.clone(),
            sound_name: session.sound_name.clone(),
            index: 0,
            total: 1,
            base_time: session.started_at,
        },
        _ => match core.store.get(&alarm_id) {
            Some(alarm) => TriggerPayload::immediate(&alarm),
            None => {
                warn!("Alarm {} awaiting dismissal has no record", alarm_id);
                TriggerPayload {
                    alarm_id: alarm_id.clone(),
                    label: String::new(),
                    sound_name: String::new(),
                    index: 0,
                    total: 1,
                    base_time: Utc::now(),
                }
            }
        },
    };

    match core.start(&payload) {
        StartOutcome::Started(_) => {
            info!("Foreground: restarted playback for alarm {}", alarm_id);
            ReconcileOutcome::Restarted
        }
        StartOutcome::Recovered => {
            info!("Foreground: resumed playback for alarm {}", alarm_id);
            ReconcileOutcome::Resumed
        }
        StartOutcome::AlreadyPlaying | StartOutcome::Rejected => ReconcileOutcome::NoAction,
    }
}
