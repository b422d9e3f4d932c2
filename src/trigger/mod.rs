//! Trigger bursts and their registration with the deferred-delivery facility.
//!
//! One armed alarm occurrence becomes a burst of N triggers spaced a few
//! seconds apart. Only the first one carries an audible cue; the rest are
//! silent so that late deliveries never stack extra audio on top of the
//! running player. If the process is frozen when the first trigger fires,
//! any later one that gets through is enough to start playback.

pub mod notification;
pub mod timer;

pub use timer::TimerTriggerCenter;

use crate::alarm::{Alarm, AlarmId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Trigger {0} could not be scheduled: {1}")]
    SubmitFailed(String, String),

    #[error("Trigger delivery is shut down")]
    ShutDown,

    #[error("Notification error: {0}")]
    Notification(String),
}

/// Alarm context carried by every trigger, so the receiving side can start
/// playback without consulting the alarm store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub alarm_id: AlarmId,
    pub label: String,
    pub sound_name: String,
    pub index: u32,
    pub total: u32,
    pub base_time: DateTime<Utc>,
}

impl TriggerPayload {
    /// Payload for a direct, unscheduled start of the given alarm.
    pub fn immediate(alarm: &Alarm) -> Self {
        Self {
            alarm_id: alarm.id.clone(),
            label: alarm.label.clone(),
            sound_name: alarm.sound_name.clone(),
            index: 0,
            total: 1,
            base_time: Utc::now(),
        }
    }
}

/// One scheduled trigger of a burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDescriptor {
    pub fire_at: DateTime<Utc>,
    /// Only index 0 carries an audible cue
    pub primed: bool,
    pub payload: TriggerPayload,
}

impl TriggerDescriptor {
    pub fn index(&self) -> u32 {
        self.payload.index
    }

    /// Registration key, `"{alarmId}-{index}"`.
    pub fn identifier(&self) -> String {
        burst_identifier(&self.payload.alarm_id, self.payload.index)
    }
}

pub fn burst_identifier(alarm_id: &AlarmId, index: u32) -> String {
    format!("{}-{}", alarm_id, index)
}

/// Identifier used by stores written before bursts existed (one trigger per alarm).
pub fn legacy_identifier(alarm_id: &AlarmId) -> String {
    alarm_id.to_string()
}

/// Every identifier a burst of `len` triggers for this alarm may have used,
/// including the legacy single-trigger one.
pub fn all_identifiers(alarm_id: &AlarmId, len: u32) -> Vec<String> {
    let mut ids: Vec<String> = (0..len).map(|i| burst_identifier(alarm_id, i)).collect();
    ids.push(legacy_identifier(alarm_id));
    ids
}

/// Ordered triggers derived from one alarm occurrence.
#[derive(Debug, Clone)]
pub struct TriggerBurst {
    triggers: Vec<TriggerDescriptor>,
}

impl TriggerBurst {
    /// Compute the burst for `alarm` firing at `base`.
    pub fn compute(alarm: &Alarm, base: DateTime<Utc>, len: u32, interval: Duration) -> Self {
        let step = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(3));
        let triggers = (0..len)
            .map(|index| TriggerDescriptor {
                fire_at: base + step * index as i32,
                primed: index == 0,
                payload: TriggerPayload {
                    alarm_id: alarm.id.clone(),
                    label: alarm.label.clone(),
                    sound_name: alarm.sound_name.clone(),
                    index,
                    total: len,
                    base_time: base,
                },
            })
            .collect();
        Self { triggers }
    }

    pub fn triggers(&self) -> &[TriggerDescriptor] {
        &self.triggers
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn primed_count(&self) -> usize {
        self.triggers.iter().filter(|t| t.primed).count()
    }

    pub fn into_triggers(self) -> Vec<TriggerDescriptor> {
        self.triggers
    }
}

/// Platform facility that delivers triggers at their fire time.
///
/// Implementations deliver into the engine event queue; submission itself
/// must not block.
pub trait TriggerCenter: Send + Sync {
    /// Schedule one trigger. Replaces any pending trigger with the same identifier.
    fn submit(&self, trigger: TriggerDescriptor) -> Result<(), TriggerError>;

    /// Cancel pending triggers. Unknown identifiers are ignored.
    fn remove_pending(&self, identifiers: &[String]);

    /// Withdraw already delivered triggers (e.g. close their notifications).
    fn remove_delivered(&self, identifiers: &[String]);

    /// Identifiers still waiting to fire.
    fn pending_identifiers(&self) -> Vec<String>;
}

/// Outcome of arming one alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArmReport {
    pub submitted: u32,
    pub failed: u32,
}

/// Computes bursts and registers them with a [`TriggerCenter`].
pub struct TriggerScheduler {
    center: Arc<dyn TriggerCenter>,
    burst_len: u32,
    interval: Duration,
}

impl TriggerScheduler {
    pub fn new(center: Arc<dyn TriggerCenter>, burst_len: u32, interval: Duration) -> Self {
        Self {
            center,
            burst_len,
            interval,
        }
    }

    pub fn burst_len(&self) -> u32 {
        self.burst_len
    }

    /// Disarm, then schedule a fresh burst for `alarm` at `target`.
    ///
    /// Best effort: a trigger that fails to submit is logged and the rest
    /// are still submitted.
    pub fn arm(&self, alarm: &Alarm, target: DateTime<Utc>) -> ArmReport {
        self.disarm(&alarm.id);

        let burst = TriggerBurst::compute(alarm, target, self.burst_len, self.interval);
        let mut report = ArmReport::default();
        for trigger in burst.into_triggers() {
            let identifier = trigger.identifier();
            match self.center.submit(trigger) {
                Ok(()) => report.submitted += 1,
                Err(e) => {
                    warn!("Failed to schedule trigger {}: {}", identifier, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Armed alarm {} for {} ({} triggers scheduled, {} failed)",
            alarm.id,
            target.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            report.submitted,
            report.failed
        );
        report
    }

    /// Remove every pending trigger of the alarm, including the legacy one.
    pub fn disarm(&self, alarm_id: &AlarmId) {
        let ids = all_identifiers(alarm_id, self.burst_len);
        self.center.remove_pending(&ids);
        debug!("Disarmed alarm {}", alarm_id);
    }

    /// Withdraw triggers of the alarm that were already delivered.
    pub fn clear_delivered(&self, alarm_id: &AlarmId) {
        let ids = all_identifiers(alarm_id, self.burst_len);
        self.center.remove_delivered(&ids);
    }

    /// Number of triggers still pending for this alarm.
    pub fn pending_count(&self, alarm_id: &AlarmId) -> usize {
        let ids = all_identifiers(alarm_id, self.burst_len);
        self.center
            .pending_identifiers()
            .iter()
            .filter(|id| ids.contains(id))
            .count()
    }

    pub fn total_pending(&self) -> usize {
        self.center.pending_identifiers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::RecordingTriggerCenter;

    fn alarm() -> Alarm {
        Alarm::new(Utc::now() + chrono::Duration::hours(1), "Work", "Radar")
    }

    // ===================
    // Burst Tests
    // ===================

    #[test]
    fn test_burst_has_exactly_one_primed_trigger() {
        for len in [1, 2, 20, 64] {
            let burst = TriggerBurst::compute(&alarm(), Utc::now(), len, Duration::from_secs(3));
            assert_eq!(burst.len(), len as usize);
            assert_eq!(burst.primed_count(), 1);
            assert!(burst.triggers()[0].primed);
            assert!(burst.triggers()[1..].iter().all(|t| !t.primed));
        }
    }

    #[test]
    fn test_burst_fire_times_are_spaced() {
        let base = Utc::now();
        let burst = TriggerBurst::compute(&alarm(), base, 20, Duration::from_secs(3));
        for (i, trigger) in burst.triggers().iter().enumerate() {
            assert_eq!(trigger.index(), i as u32);
            assert_eq!(trigger.fire_at, base + chrono::Duration::seconds(3 * i as i64));
            assert_eq!(trigger.payload.total, 20);
            assert_eq!(trigger.payload.base_time, base);
        }
    }

    #[test]
    fn test_burst_payload_carries_alarm_context() {
        let alarm = alarm();
        let burst = TriggerBurst::compute(&alarm, Utc::now(), 3, Duration::from_secs(3));
        let payload = &burst.triggers()[2].payload;
        assert_eq!(payload.alarm_id, alarm.id);
        assert_eq!(payload.label, "Work");
        assert_eq!(payload.sound_name, "Radar");
        assert_eq!(payload.index, 2);
    }

    #[test]
    fn test_identifiers() {
        let id = AlarmId::from("abc");
        assert_eq!(burst_identifier(&id, 7), "abc-7");
        assert_eq!(legacy_identifier(&id), "abc");

        let all = all_identifiers(&id, 3);
        assert_eq!(all, vec!["abc-0", "abc-1", "abc-2", "abc"]);
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = TriggerPayload::immediate(&alarm());
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("alarm_id").is_some());
        assert!(json.get("sound_name").is_some());
        assert_eq!(json["index"], 0);
    }

    // ===================
    // Scheduler Tests
    // ===================

    #[test]
    fn test_arm_submits_full_burst() {
        let center = Arc::new(RecordingTriggerCenter::new());
        let scheduler = TriggerScheduler::new(center.clone(), 20, Duration::from_secs(3));
        let alarm = alarm();

        let report = scheduler.arm(&alarm, alarm.time);
        assert_eq!(report, ArmReport { submitted: 20, failed: 0 });
        assert_eq!(scheduler.pending_count(&alarm.id), 20);
    }

    #[test]
    fn test_arm_continues_after_submit_failure() {
        let center = Arc::new(RecordingTriggerCenter::new());
        center.fail_indices(&[0, 5, 6]);
        let scheduler = TriggerScheduler::new(center.clone(), 20, Duration::from_secs(3));
        let alarm = alarm();

        let report = scheduler.arm(&alarm, alarm.time);
        assert_eq!(report.submitted, 17);
        assert_eq!(report.failed, 3);
        assert_eq!(scheduler.pending_count(&alarm.id), 17);
    }

    #[test]
    fn test_disarm_removes_burst_and_legacy_identifier() {
        let center = Arc::new(RecordingTriggerCenter::new());
        let scheduler = TriggerScheduler::new(center.clone(), 5, Duration::from_secs(3));
        let alarm = alarm();
        let other = Alarm::new(alarm.time, "Other", "beacon");

        center.insert_pending(&legacy_identifier(&alarm.id));
        scheduler.arm(&alarm, alarm.time);
        scheduler.arm(&other, other.time);

        scheduler.disarm(&alarm.id);
        assert_eq!(scheduler.pending_count(&alarm.id), 0);
        assert_eq!(scheduler.pending_count(&other.id), 5);
    }

    #[test]
    fn test_rearm_replaces_previous_burst() {
        let center = Arc::new(RecordingTriggerCenter::new());
        let scheduler = TriggerScheduler::new(center.clone(), 4, Duration::from_secs(3));
        let alarm = alarm();

        scheduler.arm(&alarm, alarm.time);
        let later = alarm.time + chrono::Duration::hours(1);
        scheduler.arm(&alarm, later);

        assert_eq!(scheduler.pending_count(&alarm.id), 4);
        let first = center.pending_trigger(&burst_identifier(&alarm.id, 0)).unwrap();
        assert_eq!(first.fire_at, later);
    }
}
