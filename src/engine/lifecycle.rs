//! Per-alarm lifecycle: armed, firing, awaiting dismissal, dismissed.
//!
//! This table is the only place that decides whether a trigger may start
//! an alarm and whether a dismissal does anything. Dismissal only ever
//! happens through an explicit user action.

use crate::alarm::AlarmId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPhase {
    Idle,
    Armed,
    Firing,
    AwaitingDismissal,
    Dismissed,
}

impl AlarmPhase {
    /// Producing (or supposed to be producing) the wake signal.
    pub fn is_firing(self) -> bool {
        matches!(self, AlarmPhase::Firing | AlarmPhase::AwaitingDismissal)
    }
}

impl fmt::Display for AlarmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlarmPhase::Idle => "idle",
            AlarmPhase::Armed => "armed",
            AlarmPhase::Firing => "firing",
            AlarmPhase::AwaitingDismissal => "awaiting dismissal",
            AlarmPhase::Dismissed => "dismissed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissOutcome {
    /// The alarm was firing and has been torn down
    Dismissed,
    /// A previous dismissal already handled it
    AlreadyDismissed,
    NotFiring,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    phases: HashMap<AlarmId, AlarmPhase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, id: &AlarmId) -> AlarmPhase {
        self.phases.get(id).copied().unwrap_or(AlarmPhase::Idle)
    }

    fn set(&mut self, id: &AlarmId, phase: AlarmPhase) {
        let previous = self.phases.insert(id.clone(), phase);
        if previous != Some(phase) {
            info!(
                "Alarm {}: {} -> {}",
                id,
                previous.unwrap_or(AlarmPhase::Idle),
                phase
            );
        }
    }

    /// Whether a trigger for this alarm may start playback.
    pub fn accepts_trigger(&self, id: &AlarmId) -> bool {
        self.phase(id) != AlarmPhase::Dismissed
    }

    /// Mark armed. A firing alarm stays firing.
    pub fn arm(&mut self, id: &AlarmId) -> bool {
        if self.phase(id).is_firing() {
            return false;
        }
        self.set(id, AlarmPhase::Armed);
        true
    }

    /// Back to idle after disarming. A firing alarm stays firing.
    pub fn disarm(&mut self, id: &AlarmId) {
        if !self.phase(id).is_firing() {
            self.phases.remove(id);
        }
    }

    /// First accepted trigger. An alarm already awaiting dismissal keeps
    /// that phase.
    pub fn fire(&mut self, id: &AlarmId) -> bool {
        match self.phase(id) {
            AlarmPhase::Idle | AlarmPhase::Armed => {
                self.set(id, AlarmPhase::Firing);
                true
            }
            AlarmPhase::Firing | AlarmPhase::AwaitingDismissal => true,
            AlarmPhase::Dismissed => false,
        }
    }

    /// The user opened the delivered trigger.
    pub fn open(&mut self, id: &AlarmId) -> bool {
        match self.phase(id) {
            AlarmPhase::Firing => {
                self.set(id, AlarmPhase::AwaitingDismissal);
                true
            }
            AlarmPhase::AwaitingDismissal => true,
            _ => false,
        }
    }

    /// Put an alarm back in front of the user after a relaunch.
    pub fn restore(&mut self, id: &AlarmId) {
        self.set(id, AlarmPhase::AwaitingDismissal);
    }

    /// Drop a firing alarm whose session was replaced by another alarm.
    pub fn preempt(&mut self, id: &AlarmId) {
        if self.phase(id).is_firing() {
            self.set(id, AlarmPhase::Idle);
        }
    }

    pub fn dismiss(&mut self, id: &AlarmId) -> DismissOutcome {
        match self.phase(id) {
            AlarmPhase::Firing | AlarmPhase::AwaitingDismissal => {
                self.set(id, AlarmPhase::Dismissed);
                DismissOutcome::Dismissed
            }
            AlarmPhase::Dismissed => DismissOutcome::AlreadyDismissed,
            AlarmPhase::Idle | AlarmPhase::Armed => DismissOutcome::NotFiring,
        }
    }

    /// Drop a dismissed alarm whose record is gone. Firing alarms are kept.
    pub fn forget(&mut self, id: &AlarmId) {
        if self.phase(id) == AlarmPhase::Dismissed {
            self.phases.remove(id);
        }
    }

    /// Number of alarms not idle.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Alarms currently awaiting dismissal.
    pub fn awaiting_dismissal(&self) -> Vec<AlarmId> {
        self.phases
            .iter()
            .filter(|(_, phase)| **phase == AlarmPhase::AwaitingDismissal)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Any alarm in a firing phase.
    pub fn firing(&self) -> Option<AlarmId> {
        self.phases
            .iter()
            .find(|(_, phase)| phase.is_firing())
            .map(|(id, _)| id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");

        assert_eq!(lifecycle.phase(&id), AlarmPhase::Idle);
        assert!(lifecycle.arm(&id));
        assert!(lifecycle.fire(&id));
        assert_eq!(lifecycle.phase(&id), AlarmPhase::Firing);
        assert!(lifecycle.open(&id));
        assert_eq!(lifecycle.phase(&id), AlarmPhase::AwaitingDismissal);
        assert_eq!(lifecycle.dismiss(&id), DismissOutcome::Dismissed);
        assert_eq!(lifecycle.phase(&id), AlarmPhase::Dismissed);
    }

    #[test]
    fn test_dismiss_is_idempotent() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");
        lifecycle.fire(&id);

        assert_eq!(lifecycle.dismiss(&id), DismissOutcome::Dismissed);
        assert_eq!(lifecycle.dismiss(&id), DismissOutcome::AlreadyDismissed);
        assert_eq!(lifecycle.dismiss(&id), DismissOutcome::AlreadyDismissed);
    }

    #[test]
    fn test_dismiss_when_not_firing() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");
        assert_eq!(lifecycle.dismiss(&id), DismissOutcome::NotFiring);
        lifecycle.arm(&id);
        assert_eq!(lifecycle.dismiss(&id), DismissOutcome::NotFiring);
        assert_eq!(lifecycle.phase(&id), AlarmPhase::Armed);
    }

    #[test]
    fn test_dismissed_alarm_rejects_triggers_until_rearmed() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");
        lifecycle.fire(&id);
        lifecycle.dismiss(&id);

        assert!(!lifecycle.accepts_trigger(&id));
        assert!(!lifecycle.fire(&id));

        lifecycle.arm(&id);
        assert!(lifecycle.accepts_trigger(&id));
        assert!(lifecycle.fire(&id));
    }

    #[test]
    fn test_fire_keeps_awaiting_dismissal() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");
        lifecycle.restore(&id);
        assert!(lifecycle.fire(&id));
        assert_eq!(lifecycle.phase(&id), AlarmPhase::AwaitingDismissal);
    }

    #[test]
    fn test_open_requires_firing() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");
        assert!(!lifecycle.open(&id));
        lifecycle.arm(&id);
        assert!(!lifecycle.open(&id));
    }

    #[test]
    fn test_arm_does_not_interrupt_firing() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");
        lifecycle.fire(&id);
        assert!(!lifecycle.arm(&id));
        lifecycle.disarm(&id);
        assert_eq!(lifecycle.phase(&id), AlarmPhase::Firing);
    }

    #[test]
    fn test_preempt_returns_to_idle() {
        let mut lifecycle = Lifecycle::new();
        let id = AlarmId::from("a");
        lifecycle.fire(&id);
        lifecycle.preempt(&id);
        assert_eq!(lifecycle.phase(&id), AlarmPhase::Idle);
        assert!(lifecycle.accepts_trigger(&id));
    }

    #[test]
    fn test_forget_drops_dismissed_only() {
        let mut lifecycle = Lifecycle::new();
        let done = AlarmId::from("done");
        let ringing = AlarmId::from("ringing");
        lifecycle.fire(&done);
        lifecycle.dismiss(&done);
        lifecycle.fire(&ringing);
        assert_eq!(lifecycle.len(), 2);

        lifecycle.forget(&done);
        lifecycle.forget(&ringing);
        assert_eq!(lifecycle.len(), 1);
        assert_eq!(lifecycle.phase(&done), AlarmPhase::Idle);
        assert_eq!(lifecycle.phase(&ringing), AlarmPhase::Firing);
    }
}
