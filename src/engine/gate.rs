//! Start arbitration and the firing session.
//!
//! [`EngineCore`] sits behind the engine's single mutex. Every path that
//! may start playback (trigger delivery, notification tap, direct test,
//! foreground reconcile, interruption restart, watchdog restart) goes
//! through [`EngineCore::claim`] while holding that mutex, so deciding
//! "is this alarm already playing?" and acting on the answer can never
//! interleave with another start. The current session is an arena of one.

use super::lifecycle::{AlarmPhase, DismissOutcome, Lifecycle};
use super::watchdog::{self, WatchdogHandles};
use super::{EngineSettings, FiringAlarm};
use crate::alarm::{Alarm, AlarmId};
use crate::lease::LeaseManager;
use crate::playback::{PlaybackEngine, PlaybackStart};
use crate::state::StateFile;
use crate::store::AlarmStore;
use crate::trigger::{TriggerPayload, TriggerScheduler};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The one alarm currently owning playback.
#[derive(Debug)]
pub struct FiringSession {
    pub alarm_id: AlarmId,
    pub label: String,
    pub sound_name: String,
    pub started_at: DateTime<Utc>,
    pub generation: u64,
    /// Audio is paused by an interruption
    pub interrupted: bool,
    watchdogs: Option<WatchdogHandles>,
}

impl FiringSession {
    fn lease_name(&self) -> String {
        format!("alarm {}", self.alarm_id)
    }
}

/// Result of asking the gate to start an alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The alarm already holds the claim
    Held { generation: u64 },
    /// A new session took the claim, replacing `preempted` if any
    Claimed {
        generation: u64,
        preempted: Option<AlarmId>,
    },
    /// The alarm may not start (already dismissed)
    Rejected,
}

/// What a start request did to playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(PlaybackStart),
    /// Same alarm, player already producing output
    AlreadyPlaying,
    /// Same alarm, dead player brought back
    Recovered,
    Rejected,
}

pub struct EngineCore {
    session: Option<FiringSession>,
    generation: u64,
    pub(super) lifecycle: Lifecycle,
    pub(super) playback: PlaybackEngine,
    pub(super) lease: LeaseManager,
    pub(super) scheduler: TriggerScheduler,
    pub(super) store: Arc<dyn AlarmStore>,
    pub(super) state: Arc<StateFile>,
    firing_tx: watch::Sender<Option<FiringAlarm>>,
    settings: EngineSettings,
    runtime: Handle,
    me: Weak<Mutex<EngineCore>>,
}

impl EngineCore {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        playback: PlaybackEngine,
        lease: LeaseManager,
        scheduler: TriggerScheduler,
        store: Arc<dyn AlarmStore>,
        state: Arc<StateFile>,
        firing_tx: watch::Sender<Option<FiringAlarm>>,
        settings: EngineSettings,
        me: Weak<Mutex<EngineCore>>,
    ) -> Self {
        Self {
            session: None,
            generation: 0,
            lifecycle: Lifecycle::new(),
            playback,
            lease,
            scheduler,
            store,
            state,
            firing_tx,
            settings,
            runtime: Handle::current(),
            me,
        }
    }

    pub fn session(&self) -> Option<&FiringSession> {
        self.session.as_ref()
    }

    pub(super) fn session_mut(&mut self) -> Option<&mut FiringSession> {
        self.session.as_mut()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while the session a timer was started for is still the current one.
    pub fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Take the claim for `alarm_id`, tearing down another alarm's session first.
    pub fn claim(&mut self, payload: &TriggerPayload) -> ClaimOutcome {
        if let Some(session) = &self.session {
            if session.alarm_id == payload.alarm_id {
                return ClaimOutcome::Held {
                    generation: session.generation,
                };
            }
        }

        if !self.lifecycle.accepts_trigger(&payload.alarm_id) {
            debug!(
                "Ignoring trigger for alarm {} ({})",
                payload.alarm_id,
                self.lifecycle.phase(&payload.alarm_id)
            );
            return ClaimOutcome::Rejected;
        }
        // Dismissed one-shot alarms are forgotten along with their record
        if self.lifecycle.phase(&payload.alarm_id) == AlarmPhase::Idle
            && self.store.get(&payload.alarm_id).is_none()
        {
            debug!("Ignoring trigger for deleted alarm {}", payload.alarm_id);
            return ClaimOutcome::Rejected;
        }

        let preempted = self.session.as_ref().map(|s| s.alarm_id.clone());
        if let Some(ref previous) = preempted {
            info!(
                "Alarm {} replaces firing alarm {}",
                payload.alarm_id, previous
            );
            self.scheduler.disarm(previous);
            self.scheduler.clear_delivered(previous);
            self.release_session();
            self.lifecycle.preempt(previous);
        }
        // A restored alarm that never got a session
        if let Some(stale) = self.lifecycle.firing() {
            if stale != payload.alarm_id {
                self.lifecycle.preempt(&stale);
            }
        }

        self.generation += 1;
        self.session = Some(FiringSession {
            alarm_id: payload.alarm_id.clone(),
            label: payload.label.clone(),
            sound_name: payload.sound_name.clone(),
            started_at: Utc::now(),
            generation: self.generation,
            interrupted: false,
            watchdogs: None,
        });

        ClaimOutcome::Claimed {
            generation: self.generation,
            preempted,
        }
    }

    /// Claim and make sure the alarm is producing sound.
    pub fn start(&mut self, payload: &TriggerPayload) -> StartOutcome {
        match self.claim(payload) {
            ClaimOutcome::Rejected => StartOutcome::Rejected,
            ClaimOutcome::Held { .. } => {
                if self.playback.is_active() {
                    StartOutcome::AlreadyPlaying
                } else {
                    self.recover_playback();
                    StartOutcome::Recovered
                }
            }
            ClaimOutcome::Claimed { generation, .. } => {
                StartOutcome::Started(self.begin_session(generation))
            }
        }
    }

    /// Genuine start for a freshly claimed session.
    fn begin_session(&mut self, generation: u64) -> PlaybackStart {
        let Some(session) = self.session.as_ref() else {
            return PlaybackStart::FallbackBeep;
        };
        let alarm_id = session.alarm_id.clone();
        let sound_name = session.sound_name.clone();
        let lease_name = session.lease_name();

        self.lifecycle.fire(&alarm_id);
        let start = self.playback.start(&sound_name);

        if let Err(e) = self.lease.acquire(&lease_name) {
            warn!("Could not acquire execution lease: {}", e);
        }

        let handles = watchdog::spawn(
            &self.runtime,
            self.me.clone(),
            generation,
            self.settings.probe_interval,
            self.settings.restart_interval,
        );
        if let Some(session) = self.session.as_mut() {
            session.watchdogs = Some(handles);
        }

        if let Err(e) = self.state.set_firing(Some(alarm_id.clone())) {
            warn!("Failed to persist firing alarm: {}", e);
        }
        self.publish();

        info!(
            "Alarm {} firing (session {}, {})",
            alarm_id,
            generation,
            if start.is_success() { "player" } else { "beep" }
        );
        start
    }

    /// Bring back sound for the current session: resume the player in
    /// place, or rebuild it if it is gone or cannot resume.
    pub fn recover_playback(&mut self) {
        let Some(sound_name) = self.session.as_ref().map(|s| s.sound_name.clone()) else {
            return;
        };
        if self.playback.has_player() {
            match self.playback.resume() {
                Ok(()) if self.playback.is_active() => {
                    debug!("Player resumed in place");
                    return;
                }
                Ok(()) => debug!("Player resumed but produces no output"),
                Err(e) => debug!("Resume failed: {}", e),
            }
        }
        self.playback.restart(&sound_name);
    }

    /// Recreate the player and renew the lease.
    pub fn force_restart(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let sound_name = session.sound_name.clone();
        let lease_name = session.lease_name();
        self.playback.restart(&sound_name);
        if let Err(e) = self.lease.renew(&lease_name) {
            warn!("Lease renewal failed: {}", e);
        }
    }

    /// Stop playback, watchdogs and lease, then release the claim.
    fn release_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(handles) = session.watchdogs.take() {
                handles.abort();
            }
            debug!("Released session {} of alarm {}", session.generation, session.alarm_id);
        }
        self.playback.stop();
        self.lease.release();
    }

    /// Release the session without touching lifecycle or persisted state.
    pub fn shutdown(&mut self) {
        self.release_session();
    }

    /// Single teardown for a dismissed or snoozed alarm.
    pub fn dismiss(&mut self, alarm_id: &AlarmId) -> DismissOutcome {
        let outcome = self.lifecycle.dismiss(alarm_id);
        match outcome {
            DismissOutcome::Dismissed => {
                self.scheduler.disarm(alarm_id);
                self.scheduler.clear_delivered(alarm_id);
                if self
                    .session
                    .as_ref()
                    .is_some_and(|s| &s.alarm_id == alarm_id)
                {
                    self.release_session();
                }
                if let Err(e) = self.state.set_firing(None) {
                    warn!("Failed to clear persisted firing alarm: {}", e);
                }
                self.publish();
                self.retire_record(alarm_id);
                info!("Alarm {} dismissed", alarm_id);
            }
            DismissOutcome::AlreadyDismissed => {
                debug!("Alarm {} already dismissed", alarm_id);
            }
            DismissOutcome::NotFiring => {
                debug!("Dismiss for alarm {} that is not firing", alarm_id);
            }
        }
        outcome
    }

    /// One-shot records are deleted along with their lifecycle entry,
    /// recurring ones disabled.
    fn retire_record(&mut self, alarm_id: &AlarmId) {
        let Some(alarm) = self.store.get(alarm_id) else {
            self.lifecycle.forget(alarm_id);
            return;
        };
        let result = if alarm.is_one_shot() {
            self.store
                .remove(alarm_id)
                .map(|_| self.lifecycle.forget(alarm_id))
        } else {
            self.store.set_enabled(alarm_id, false)
        };
        if let Err(e) = result {
            warn!("Failed to update alarm {} after dismissal: {}", alarm_id, e);
        }
    }

    /// Schedule the burst for an alarm and mark it armed.
    pub fn arm(&mut self, alarm: &Alarm) -> bool {
        if !alarm.is_armable(Utc::now()) {
            self.disarm(&alarm.id);
            return false;
        }
        self.scheduler.arm(alarm, alarm.time);
        self.lifecycle.arm(&alarm.id);
        true
    }

    /// Cancel the pending burst. A firing alarm keeps firing.
    pub fn disarm(&mut self, alarm_id: &AlarmId) {
        self.scheduler.disarm(alarm_id);
        self.lifecycle.disarm(alarm_id);
    }

    /// Snapshot of the current firing alarm for observers.
    pub fn firing_alarm(&self) -> Option<FiringAlarm> {
        if let Some(session) = &self.session {
            return Some(FiringAlarm {
                alarm_id: session.alarm_id.clone(),
                label: session.label.clone(),
                sound_name: session.sound_name.clone(),
                started_at: session.started_at,
                phase: self.lifecycle.phase(&session.alarm_id),
            });
        }
        // Restored but not yet playing
        self.lifecycle.firing().map(|alarm_id| {
            let record = self.store.get(&alarm_id);
            FiringAlarm {
                label: record.as_ref().map(|a| a.label.clone()).unwrap_or_default(),
                sound_name: record.map(|a| a.sound_name).unwrap_or_default(),
                phase: self.lifecycle.phase(&alarm_id),
                alarm_id,
                started_at: Utc::now(),
            }
        })
    }

    /// Push the current firing alarm to subscribers.
    pub fn publish(&self) {
        let current = self.firing_alarm();
        self.firing_tx.send_if_modified(|value| {
            let changed = value.as_ref().map(|f| (&f.alarm_id, f.phase))
                != current.as_ref().map(|f| (&f.alarm_id, f.phase));
            if changed {
                *value = current;
            }
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<FiringAlarm>> {
        self.firing_tx.subscribe()
    }

    pub fn phase_of_session(&self) -> Option<AlarmPhase> {
        self.session
            .as_ref()
            .map(|s| self.lifecycle.phase(&s.alarm_id))
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(handles) = session.watchdogs.take() {
                handles.abort();
            }
        }
    }
}
