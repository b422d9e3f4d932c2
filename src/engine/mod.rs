//! Alarm delivery and playback reliability engine.
//!
//! Ties the trigger scheduler, playback, watchdogs and execution lease
//! together behind one lock. Platform callbacks arrive as [`EngineEvent`]s
//! on a single queue and are fed to [`AlarmEngine::dispatch`]; UI and IPC
//! call the public methods directly.

pub mod gate;
pub mod interruption;
pub mod lifecycle;
pub mod reconcile;
pub mod watchdog;

#[cfg(test)]
pub mod fakes;

pub use gate::{ClaimOutcome, StartOutcome};
pub use interruption::AudioInterruption;
pub use lifecycle::{AlarmPhase, DismissOutcome};
pub use reconcile::ReconcileOutcome;

use crate::alarm::{Alarm, AlarmId};
use crate::config::Config;
use crate::lease::{LeaseManager, LeaseProvider, LeaseToken};
use crate::playback::{AudioBackend, PlaybackEngine, SoundCatalog};
use crate::state::StateFile;
use crate::store::AlarmStore;
use crate::trigger::{TriggerCenter, TriggerPayload, TriggerScheduler};
use chrono::{DateTime, Utc};
use gate::EngineCore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// User interaction with a delivered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    /// The notification itself was opened
    Open,
    Stop,
    Snooze,
}

/// Platform callbacks, queued for the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TriggerDelivered(TriggerPayload),
    TriggerAction {
        alarm_id: AlarmId,
        action: TriggerAction,
    },
    Interruption(AudioInterruption),
    LeaseExpired(LeaseToken),
    Foreground,
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Create the engine event queue.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// The alarm currently firing, as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiringAlarm {
    pub alarm_id: AlarmId,
    pub label: String,
    pub sound_name: String,
    pub started_at: DateTime<Utc>,
    pub phase: AlarmPhase,
}

/// Tunables, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub burst_len: u32,
    pub trigger_interval: Duration,
    pub probe_interval: Duration,
    pub restart_interval: Duration,
    pub beep_interval: Duration,
    pub snooze_delay: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            burst_len: 20,
            trigger_interval: Duration::from_secs(3),
            probe_interval: Duration::from_secs(2),
            restart_interval: Duration::from_secs(30),
            beep_interval: Duration::from_millis(1500),
            snooze_delay: chrono::Duration::minutes(5),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            burst_len: config.triggers.burst_len,
            trigger_interval: config.triggers.interval(),
            probe_interval: config.watchdog.probe_interval(),
            restart_interval: config.watchdog.restart_interval(),
            beep_interval: config.playback.beep_interval(),
            snooze_delay: config.snooze.delay(),
        }
    }
}

/// Platform adapters and collaborators the engine drives.
pub struct EngineParts {
    pub trigger_center: Arc<dyn TriggerCenter>,
    pub audio: Arc<dyn AudioBackend>,
    pub leases: Arc<dyn LeaseProvider>,
    pub store: Arc<dyn AlarmStore>,
    pub state: Arc<StateFile>,
    pub catalog: SoundCatalog,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub firing: Option<FiringAlarm>,
    pub generation: u64,
    pub sound: Option<String>,
    pub playing: bool,
    pub beeping: bool,
    pub interrupted: bool,
    pub lease_remaining_secs: Option<u64>,
    pub pending_triggers: usize,
}

/// Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct AlarmEngine {
    core: Arc<Mutex<EngineCore>>,
}

impl AlarmEngine {
    /// Must be called inside a tokio runtime. Lease expiry is reported on `events`.
    pub fn new(parts: EngineParts, settings: EngineSettings, events: EventSender) -> Self {
        let scheduler = TriggerScheduler::new(
            parts.trigger_center,
            settings.burst_len,
            settings.trigger_interval,
        );
        let playback = PlaybackEngine::new(parts.audio, parts.catalog, settings.beep_interval);
        let lease = LeaseManager::new(parts.leases, events);
        let (firing_tx, _) = watch::channel(None);

        let core = Arc::new_cyclic(|me| {
            Mutex::new(EngineCore::new(
                playback,
                lease,
                scheduler,
                parts.store,
                parts.state,
                firing_tx,
                settings,
                me.clone(),
            ))
        });
        Self { core }
    }

    fn lock(&self) -> MutexGuard<'_, EngineCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one queued platform callback to the engine.
    pub fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::TriggerDelivered(payload) => {
                self.deliver_trigger(&payload);
            }
            EngineEvent::TriggerAction { alarm_id, action } => {
                self.handle_action(&alarm_id, action);
            }
            EngineEvent::Interruption(AudioInterruption::Began) => {
                self.interruption_began();
            }
            EngineEvent::Interruption(AudioInterruption::Ended) => {
                self.interruption_ended();
            }
            EngineEvent::LeaseExpired(token) => self.lease_expired(token),
            EngineEvent::Foreground => {
                self.foreground();
            }
        }
    }

    /// A trigger of a burst was delivered by the platform.
    pub fn deliver_trigger(&self, payload: &TriggerPayload) -> StartOutcome {
        debug!(
            "Trigger {}/{} delivered for alarm {}",
            payload.index + 1,
            payload.total,
            payload.alarm_id
        );
        self.lock().start(payload)
    }

    /// Start an alarm right away through the same gate as delivered triggers.
    pub fn start_now(&self, alarm: &Alarm) -> StartOutcome {
        info!("Direct start of alarm {}", alarm.id);
        let mut core = self.lock();
        // A test start of a dismissed alarm is allowed
        if core.lifecycle.phase(&alarm.id) == AlarmPhase::Dismissed {
            core.lifecycle.arm(&alarm.id);
        }
        core.start(&TriggerPayload::immediate(alarm))
    }

    pub fn handle_action(&self, alarm_id: &AlarmId, action: TriggerAction) {
        debug!("Action {:?} for alarm {}", action, alarm_id);
        match action {
            TriggerAction::Open => {
                self.open(alarm_id);
            }
            TriggerAction::Stop => {
                self.dismiss(alarm_id);
            }
            TriggerAction::Snooze => {
                self.snooze(alarm_id);
            }
        }
    }

    /// The user opened the alarm. Makes sure it plays, then waits for dismissal.
    pub fn open(&self, alarm_id: &AlarmId) -> bool {
        let mut core = self.lock();
        match core.lifecycle.phase(alarm_id) {
            AlarmPhase::Dismissed => return false,
            phase if !phase.is_firing() => {
                // Tap on a trigger whose delivery never started playback
                let Some(alarm) = core.store.get(alarm_id) else {
                    return false;
                };
                if matches!(core.start(&TriggerPayload::immediate(&alarm)), StartOutcome::Rejected) {
                    return false;
                }
            }
            _ => {
                let holds_claim = core.session().is_some_and(|s| &s.alarm_id == alarm_id);
                if !holds_claim || !core.playback.is_active() {
                    if let Some(alarm) = core.store.get(alarm_id) {
                        core.start(&TriggerPayload::immediate(&alarm));
                    }
                }
            }
        }
        let opened = core.lifecycle.open(alarm_id);
        core.publish();
        opened
    }

    /// Explicit dismissal. Idempotent.
    pub fn dismiss(&self, alarm_id: &AlarmId) -> DismissOutcome {
        self.lock().dismiss(alarm_id)
    }

    /// Dismiss, then arm a one-shot alarm after the snooze delay.
    pub fn snooze(&self, alarm_id: &AlarmId) -> Option<Alarm> {
        let mut core = self.lock();
        let (label, sound_name) = match core.firing_alarm() {
            Some(firing) if &firing.alarm_id == alarm_id => (firing.label, firing.sound_name),
            _ => match core.store.get(alarm_id) {
                Some(alarm) => (alarm.label, alarm.sound_name),
                None => (String::new(), String::new()),
            },
        };

        if core.dismiss(alarm_id) != DismissOutcome::Dismissed {
            debug!("Snooze ignored, alarm {} is not firing", alarm_id);
            return None;
        }

        let snoozed = Alarm::one_shot(Utc::now() + core.settings().snooze_delay, label, sound_name);
        if let Err(e) = core.store.upsert(snoozed.clone()) {
            warn!("Failed to save snoozed alarm: {}", e);
        }
        core.arm(&snoozed);
        info!(
            "Alarm {} snoozed until {}",
            alarm_id,
            snoozed.time.with_timezone(&chrono::Local).format("%H:%M:%S")
        );
        Some(snoozed)
    }

    pub fn is_firing(&self, alarm_id: &AlarmId) -> bool {
        self.lock().lifecycle.phase(alarm_id).is_firing()
    }

    pub fn phase(&self, alarm_id: &AlarmId) -> AlarmPhase {
        self.lock().lifecycle.phase(alarm_id)
    }

    /// The firing alarm, if any.
    pub fn current(&self) -> Option<FiringAlarm> {
        self.lock().firing_alarm()
    }

    /// Observe the currently firing alarm.
    pub fn subscribe(&self) -> watch::Receiver<Option<FiringAlarm>> {
        self.lock().subscribe()
    }

    /// The app came to the foreground.
    pub fn foreground(&self) -> ReconcileOutcome {
        reconcile::foreground(&mut self.lock())
    }

    pub fn interruption_began(&self) -> bool {
        interruption::began(&mut self.lock())
    }

    pub fn interruption_ended(&self) -> bool {
        interruption::ended(&mut self.lock())
    }

    pub fn lease_expired(&self, token: LeaseToken) {
        let mut core = self.lock();
        let Some(name) = core.session().map(|s| format!("alarm {}", s.alarm_id)) else {
            debug!("Lease {} expired with no firing alarm", token);
            return;
        };
        if core.lease.handle_expiry(token, &name).is_some() {
            info!("Execution lease renewed after expiry warning");
        }
    }

    /// An alarm was created, enabled or edited.
    pub fn on_alarm_armed(&self, alarm: &Alarm) -> bool {
        self.lock().arm(alarm)
    }

    /// An alarm was disabled or deleted.
    pub fn on_alarm_disarmed(&self, alarm_id: &AlarmId) {
        self.lock().disarm(alarm_id);
    }

    /// Put an alarm persisted as firing back in front of the user.
    pub fn restore_from_state(&self) -> Option<AlarmId> {
        let mut core = self.lock();
        let alarm_id = core.state.snapshot().firing_alarm_id?;
        if core.store.get(&alarm_id).is_none() {
            warn!("Persisted firing alarm {} no longer exists", alarm_id);
            if let Err(e) = core.state.set_firing(None) {
                warn!("Failed to clear persisted firing alarm: {}", e);
            }
            return None;
        }
        info!("Restoring alarm {} awaiting dismissal", alarm_id);
        core.lifecycle.restore(&alarm_id);
        core.publish();
        Some(alarm_id)
    }

    pub fn status(&self) -> EngineStatus {
        let core = self.lock();
        let playback = core.playback.status();
        EngineStatus {
            firing: core.firing_alarm(),
            generation: core.generation(),
            sound: playback.source,
            playing: playback.active,
            beeping: playback.beeping,
            interrupted: core.session().is_some_and(|s| s.interrupted),
            lease_remaining_secs: core.lease.remaining().map(|d| d.as_secs()),
            pending_triggers: core.scheduler.total_pending(),
        }
    }

    /// Stop everything without dismissing (daemon shutdown). The persisted
    /// firing alarm is kept so the next launch restores it.
    pub fn shutdown(&self) {
        self.lock().shutdown();
    }
}
