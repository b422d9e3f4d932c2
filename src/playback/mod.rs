//! Continuous alarm sound playback.
//!
//! [`PlaybackEngine`] owns at most one player. Starting walks the sound
//! fallback chain (requested asset, preferred assets, default alert tone)
//! and, if no player can be created at all, falls back to a timer-driven
//! beep so that some signal is always produced. Retrying a player that
//! died is not done here; the watchdogs call [`PlaybackEngine::restart`].

pub mod cpal_backend;
pub mod sounds;

pub use cpal_backend::CpalBackend;
pub use sounds::{SoundCatalog, SoundSource};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No audio output device available")]
    NoOutputDevice,

    #[error("Audio output error: {0}")]
    Output(String),

    #[error("Failed to load sound {0}: {1}")]
    Asset(String, String),

    #[error("Failed to build audio stream: {0}")]
    Stream(String),

    #[error("No player to resume")]
    PlayerGone,
}

/// A looping sound player.
pub trait Player: Send {
    /// Start or resume output.
    fn play(&mut self) -> Result<(), PlaybackError>;

    fn pause(&mut self);

    /// Stop and release the underlying output. The player is unusable afterwards.
    fn stop(&mut self);

    /// Whether the player is actually producing output right now.
    fn is_playing(&self) -> bool;
}

/// Platform audio output.
pub trait AudioBackend: Send + Sync {
    /// Acquire the audio output for background-capable playback, preferring
    /// the loudspeaker route.
    fn activate(&self) -> Result<(), PlaybackError>;

    /// Release the audio output.
    fn deactivate(&self);

    /// Create a player for `source`, configured to repeat indefinitely.
    fn open_player(&self, source: &SoundSource) -> Result<Box<dyn Player>, PlaybackError>;

    /// Emit one short platform beep.
    fn beep(&self);
}

/// How a start attempt ended up producing sound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStart {
    Player(SoundSource),
    FallbackBeep,
}

impl PlaybackStart {
    /// True when a real player is running rather than the beep fallback.
    pub fn is_success(&self) -> bool {
        matches!(self, PlaybackStart::Player(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Player(SoundSource),
    Beep,
}

/// Diagnostic view of the playback engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub source: Option<String>,
    pub active: bool,
    pub beeping: bool,
}

pub struct PlaybackEngine {
    backend: Arc<dyn AudioBackend>,
    catalog: SoundCatalog,
    runtime: Handle,
    beep_interval: Duration,
    player: Option<Box<dyn Player>>,
    beep_task: Option<JoinHandle<()>>,
    mode: Option<Mode>,
    output_active: bool,
}

impl PlaybackEngine {
    /// Must be called inside a tokio runtime.
    pub fn new(backend: Arc<dyn AudioBackend>, catalog: SoundCatalog, beep_interval: Duration) -> Self {
        Self {
            backend,
            catalog,
            runtime: Handle::current(),
            beep_interval,
            player: None,
            beep_task: None,
            mode: None,
            output_active: false,
        }
    }

    pub fn catalog(&self) -> &SoundCatalog {
        &self.catalog
    }

    /// Start sound for `sound_name`, replacing whatever is playing.
    pub fn start(&mut self, sound_name: &str) -> PlaybackStart {
        self.release_sources();

        match self.backend.activate() {
            Ok(()) => self.output_active = true,
            Err(e) => warn!("Audio output activation failed: {}", e),
        }

        for source in self.catalog.fallback_chain(sound_name) {
            match self.open_and_play(&source) {
                Ok(player) => {
                    info!("Playing alarm sound '{}'", source.name());
                    self.player = Some(player);
                    self.mode = Some(Mode::Player(source.clone()));
                    return PlaybackStart::Player(source);
                }
                Err(e) => warn!("Sound '{}' failed to start: {}", source.name(), e),
            }
        }

        warn!("No player could be started, falling back to timed beep");
        self.start_beep();
        self.mode = Some(Mode::Beep);
        PlaybackStart::FallbackBeep
    }

    fn open_and_play(&self, source: &SoundSource) -> Result<Box<dyn Player>, PlaybackError> {
        let mut player = self.backend.open_player(source)?;
        match player.play() {
            Ok(()) => Ok(player),
            Err(e) => {
                player.stop();
                Err(e)
            }
        }
    }

    fn start_beep(&mut self) {
        let backend = Arc::clone(&self.backend);
        let period = self.beep_interval;
        self.beep_task = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                backend.beep();
            }
        }));
    }

    /// Tear down and recreate the player from scratch.
    pub fn restart(&mut self, sound_name: &str) -> PlaybackStart {
        debug!("Restarting playback from scratch");
        self.stop();
        self.start(sound_name)
    }

    /// Pause in place, keeping the player for a later [`resume`](Self::resume).
    pub fn pause(&mut self) {
        if let Some(player) = self.player.as_mut() {
            player.pause();
        }
        if let Some(task) = self.beep_task.take() {
            task.abort();
        }
    }

    /// Resume the existing player in place.
    ///
    /// Fails with [`PlaybackError::PlayerGone`] when there is nothing to
    /// resume; the caller is expected to restart instead.
    pub fn resume(&mut self) -> Result<(), PlaybackError> {
        match self.mode {
            Some(Mode::Player(_)) => {
                if !self.output_active {
                    self.backend.activate()?;
                    self.output_active = true;
                }
                let player = self.player.as_mut().ok_or(PlaybackError::PlayerGone)?;
                player.play()
            }
            Some(Mode::Beep) => {
                if !self.beep_running() {
                    self.start_beep();
                }
                Ok(())
            }
            None => Err(PlaybackError::PlayerGone),
        }
    }

    /// Re-acquire the audio output, e.g. after an interruption.
    pub fn reactivate(&mut self) -> Result<(), PlaybackError> {
        self.backend.activate()?;
        self.output_active = true;
        Ok(())
    }

    /// Stop and release the player and the audio output.
    pub fn stop(&mut self) {
        let was_playing = self.mode.is_some();
        self.release_sources();
        if self.output_active {
            self.backend.deactivate();
            self.output_active = false;
        }
        if was_playing {
            info!("Playback stopped");
        }
    }

    fn release_sources(&mut self) {
        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        if let Some(task) = self.beep_task.take() {
            task.abort();
        }
        self.mode = None;
    }

    fn beep_running(&self) -> bool {
        self.beep_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// A player (or the beep fallback) exists, whether or not it is producing output.
    pub fn has_player(&self) -> bool {
        self.mode.is_some()
    }

    /// Sound is actually being produced.
    pub fn is_active(&self) -> bool {
        match self.mode {
            Some(Mode::Player(_)) => self.player.as_ref().is_some_and(|p| p.is_playing()),
            Some(Mode::Beep) => self.beep_running(),
            None => false,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            source: match &self.mode {
                Some(Mode::Player(source)) => Some(source.name().to_string()),
                Some(Mode::Beep) => Some("beep".to_string()),
                None => None,
            },
            active: self.is_active(),
            beeping: matches!(self.mode, Some(Mode::Beep)),
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
