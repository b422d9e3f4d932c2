//! In-process fakes of the platform adapters for tests.

use super::{event_channel, AlarmEngine, EngineParts, EngineSettings, EventReceiver, EventSender};
use crate::lease::{ExpiryCallback, LeaseError, LeaseProvider, LeaseToken};
use crate::playback::{AudioBackend, PlaybackError, Player, SoundCatalog, SoundSource};
use crate::state::StateFile;
use crate::store::{AlarmStore, MemoryAlarmStore};
use crate::trigger::{TriggerCenter, TriggerDescriptor, TriggerError, TriggerPayload};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ===================
// Trigger center
// ===================

/// Keeps submitted triggers in memory; delivery is driven by the test.
#[derive(Default)]
pub struct RecordingTriggerCenter {
    pending: Mutex<BTreeMap<String, Option<TriggerDescriptor>>>,
    delivered: Mutex<HashSet<String>>,
    fail: Mutex<HashSet<u32>>,
    submitted: AtomicUsize,
}

impl RecordingTriggerCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make submissions of these burst indices fail.
    pub fn fail_indices(&self, indices: &[u32]) {
        lock(&self.fail).extend(indices.iter().copied());
    }

    /// Register a bare identifier, as left behind by an older version.
    pub fn insert_pending(&self, identifier: &str) {
        lock(&self.pending).insert(identifier.to_string(), None);
    }

    pub fn pending_trigger(&self, identifier: &str) -> Option<TriggerDescriptor> {
        lock(&self.pending).get(identifier).cloned().flatten()
    }

    /// Deliver a pending trigger, returning its payload.
    pub fn deliver(&self, identifier: &str) -> Option<TriggerPayload> {
        let trigger = lock(&self.pending).remove(identifier).flatten()?;
        lock(&self.delivered).insert(identifier.to_string());
        Some(trigger.payload)
    }

    pub fn delivered_identifiers(&self) -> Vec<String> {
        lock(&self.delivered).iter().cloned().collect()
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl TriggerCenter for RecordingTriggerCenter {
    fn submit(&self, trigger: TriggerDescriptor) -> Result<(), TriggerError> {
        let identifier = trigger.identifier();
        if lock(&self.fail).contains(&trigger.index()) {
            return Err(TriggerError::SubmitFailed(identifier, "rejected".into()));
        }
        lock(&self.pending).insert(identifier, Some(trigger));
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_pending(&self, identifiers: &[String]) {
        let mut pending = lock(&self.pending);
        for id in identifiers {
            pending.remove(id);
        }
    }

    fn remove_delivered(&self, identifiers: &[String]) {
        let mut delivered = lock(&self.delivered);
        for id in identifiers {
            delivered.remove(id);
        }
    }

    fn pending_identifiers(&self) -> Vec<String> {
        lock(&self.pending).keys().cloned().collect()
    }
}

// ===================
// Audio
// ===================

#[derive(Default)]
struct FakePlayerState {
    playing: AtomicBool,
    stopped: AtomicBool,
}

#[derive(Default)]
struct FakeAudioState {
    output_active: AtomicBool,
    activations: AtomicUsize,
    active_players: AtomicUsize,
    max_concurrent: AtomicUsize,
    created: AtomicUsize,
    beeps: AtomicUsize,
    fail_all: AtomicBool,
    failing: Mutex<HashSet<String>>,
    players: Mutex<Vec<Weak<FakePlayerState>>>,
}

/// Audio backend counting players, never touching a real device.
#[derive(Default)]
pub struct FakeAudioBackend {
    state: Arc<FakeAudioState>,
}

impl FakeAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening a player for this sound fails.
    pub fn fail_source(&self, name: &str) {
        lock(&self.state.failing).insert(name.to_string());
    }

    pub fn fail_all_players(&self, fail: bool) {
        self.state.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Silently stop every live player, as a suspended process would.
    pub fn stall_players(&self) {
        for player in lock(&self.state.players).iter().filter_map(Weak::upgrade) {
            player.playing.store(false, Ordering::SeqCst);
        }
    }

    /// Kill every live player so it cannot be resumed.
    pub fn kill_players(&self) {
        for player in lock(&self.state.players).iter().filter_map(Weak::upgrade) {
            player.playing.store(false, Ordering::SeqCst);
            player.stopped.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_output_active(&self) -> bool {
        self.state.output_active.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> usize {
        self.state.activations.load(Ordering::SeqCst)
    }

    pub fn active_players(&self) -> usize {
        self.state.active_players.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_players(&self) -> usize {
        self.state.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn players_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn beep_count(&self) -> usize {
        self.state.beeps.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeAudioBackend {
    fn activate(&self) -> Result<(), PlaybackError> {
        self.state.output_active.store(true, Ordering::SeqCst);
        self.state.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&self) {
        self.state.output_active.store(false, Ordering::SeqCst);
    }

    fn open_player(&self, source: &SoundSource) -> Result<Box<dyn Player>, PlaybackError> {
        if self.state.fail_all.load(Ordering::SeqCst)
            || lock(&self.state.failing).contains(source.name())
        {
            return Err(PlaybackError::Stream(format!("cannot open {}", source.name())));
        }

        let player_state = Arc::new(FakePlayerState::default());
        lock(&self.state.players).push(Arc::downgrade(&player_state));

        self.state.created.fetch_add(1, Ordering::SeqCst);
        let active = self.state.active_players.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_concurrent.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(FakePlayer {
            state: player_state,
            backend: Arc::clone(&self.state),
            released: false,
        }))
    }

    fn beep(&self) {
        self.state.beeps.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakePlayer {
    state: Arc<FakePlayerState>,
    backend: Arc<FakeAudioState>,
    released: bool,
}

impl Player for FakePlayer {
    fn play(&mut self) -> Result<(), PlaybackError> {
        if self.state.stopped.load(Ordering::SeqCst) {
            return Err(PlaybackError::PlayerGone);
        }
        self.state.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&mut self) {
        self.state.playing.store(false, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.state.playing.store(false, Ordering::SeqCst);
        self.state.stopped.store(true, Ordering::SeqCst);
        if !self.released {
            self.released = true;
            self.backend.active_players.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_playing(&self) -> bool {
        self.state.playing.load(Ordering::SeqCst) && !self.state.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for FakePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ===================
// Leases
// ===================

/// Lease provider whose expiry is triggered by the test.
#[derive(Default)]
pub struct ManualLeaseProvider {
    next: AtomicU64,
    outstanding: Mutex<HashMap<LeaseToken, Option<ExpiryCallback>>>,
    begun: AtomicUsize,
    ended: AtomicUsize,
    deny: AtomicBool,
    expire_on_begin: AtomicBool,
}

impl ManualLeaseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Fire the expiry callback from inside `begin`, before the token is returned.
    pub fn expire_on_begin(&self, expire: bool) {
        self.expire_on_begin.store(expire, Ordering::SeqCst);
    }

    /// Fire the expiry callback of `token`. False if unknown or already fired.
    pub fn expire(&self, token: LeaseToken) -> bool {
        let callback = lock(&self.outstanding).get_mut(&token).and_then(Option::take);
        match callback {
            Some(callback) => {
                callback(token);
                true
            }
            None => false,
        }
    }

    pub fn begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.outstanding).len()
    }
}

impl LeaseProvider for ManualLeaseProvider {
    fn begin(&self, name: &str, on_expiry: ExpiryCallback) -> Result<LeaseToken, LeaseError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(LeaseError::Denied(name.to_string()));
        }
        let token = LeaseToken::new(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.begun.fetch_add(1, Ordering::SeqCst);
        if self.expire_on_begin.load(Ordering::SeqCst) {
            lock(&self.outstanding).insert(token, None);
            on_expiry(token);
        } else {
            lock(&self.outstanding).insert(token, Some(on_expiry));
        }
        Ok(token)
    }

    fn end(&self, token: LeaseToken) {
        if lock(&self.outstanding).remove(&token).is_some() {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn remaining(&self, token: LeaseToken) -> Option<Duration> {
        lock(&self.outstanding)
            .contains_key(&token)
            .then(|| Duration::from_secs(60))
    }
}

// ===================
// Engine harness
// ===================

/// An engine wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub engine: AlarmEngine,
    pub center: Arc<RecordingTriggerCenter>,
    pub audio: Arc<FakeAudioBackend>,
    pub leases: Arc<ManualLeaseProvider>,
    pub store: Arc<MemoryAlarmStore>,
    pub state: Arc<StateFile>,
    /// Posts events as a platform adapter would
    pub sender: EventSender,
    pub events: EventReceiver,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_state(settings, Arc::new(StateFile::in_memory()), MemoryAlarmStore::new())
    }

    pub fn with_state(settings: EngineSettings, state: Arc<StateFile>, store: MemoryAlarmStore) -> Self {
        let center = Arc::new(RecordingTriggerCenter::new());
        let audio = Arc::new(FakeAudioBackend::new());
        let leases = Arc::new(ManualLeaseProvider::new());
        let store = Arc::new(store);
        let (tx, events) = event_channel();

        let preference: Vec<String> = crate::playback::sounds::DEFAULT_PREFERENCE
            .iter()
            .map(|s| s.to_string())
            .collect();
        let catalog = SoundCatalog::from_assets(
            vec![
                ("radar".to_string(), PathBuf::from("/sounds/radar.wav")),
                ("chimes".to_string(), PathBuf::from("/sounds/chimes.wav")),
            ],
            &preference,
        );

        let engine = AlarmEngine::new(
            EngineParts {
                trigger_center: center.clone(),
                audio: audio.clone(),
                leases: leases.clone(),
                store: store.clone() as Arc<dyn AlarmStore>,
                state: Arc::clone(&state),
                catalog,
            },
            settings,
            tx.clone(),
        );

        Self {
            engine,
            center,
            audio,
            leases,
            store,
            state,
            sender: tx,
            events,
        }
    }

    /// Feed every queued event to the engine.
    pub fn pump(&mut self) -> usize {
        let mut n = 0;
        while let Ok(event) = self.events.try_recv() {
            self.engine.dispatch(event);
            n += 1;
        }
        n
    }
}
