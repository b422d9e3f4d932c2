//! Audio output using cpal.
//!
//! Every player owns a dedicated thread holding its cpal stream (streams
//! are not `Send` on every host). The stream callback loops a mono sample
//! buffer forever and stamps the time of each callback, which is how
//! [`Player::is_playing`] tells a running stream from one the system has
//! silently stopped.

use super::{AudioBackend, PlaybackError, Player, SoundSource};
use crate::engine::{AudioInterruption, EngineEvent, EventSender};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, StreamConfig};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A stream with no callback for this long is considered stalled.
const STALL_THRESHOLD_MS: u64 = 1000;

/// How long to wait for the audio thread to answer a command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the device monitor looks for a usable output after an interruption.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sample rate of the built-in alert tone before resampling.
const TONE_SAMPLE_RATE: u32 = 44100;

pub struct CpalBackend {
    volume: f32,
    output_device: Option<String>,
    events: Option<EventSender>,
    active_route: Mutex<Option<String>>,
    monitoring: Arc<AtomicBool>,
}

impl CpalBackend {
    /// `events` receives interruption began/ended signals when a stream fails.
    pub fn new(volume: f32, output_device: Option<String>, events: Option<EventSender>) -> Self {
        Self {
            volume,
            output_device,
            events,
            active_route: Mutex::new(None),
            monitoring: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pick the preferred output device, falling back to the host default.
    fn select_device(&self) -> Result<Device, PlaybackError> {
        let host = cpal::default_host();

        if let Some(ref preferred) = self.output_device {
            let preferred = preferred.to_lowercase();
            if let Ok(mut devices) = host.output_devices() {
                if let Some(device) = devices.find(|d| {
                    d.name()
                        .map(|n| n.to_lowercase().contains(&preferred))
                        .unwrap_or(false)
                }) {
                    return Ok(device);
                }
            }
            debug!("Preferred output '{}' not found, using default", preferred);
        }

        host.default_output_device()
            .ok_or(PlaybackError::NoOutputDevice)
    }

    /// Called from a stream error callback.
    fn report_stream_failure(&self) -> impl Fn() + Send + 'static {
        let events = self.events.clone();
        let monitoring = Arc::clone(&self.monitoring);
        move || {
            let Some(ref events) = events else {
                return;
            };
            if monitoring.swap(true, Ordering::SeqCst) {
                return;
            }
            let _ = events.send(EngineEvent::Interruption(AudioInterruption::Began));
            spawn_device_monitor(events.clone(), Arc::clone(&monitoring));
        }
    }
}

/// Watch for an output device to come back and signal the end of the interruption.
fn spawn_device_monitor(events: EventSender, monitoring: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("reveille-device-monitor".into())
        .spawn(move || {
            loop {
                std::thread::sleep(DEVICE_POLL_INTERVAL);
                if events.is_closed() {
                    break;
                }
                if cpal::default_host().default_output_device().is_some() {
                    info!("Audio output available again");
                    let _ = events.send(EngineEvent::Interruption(AudioInterruption::Ended));
                    break;
                }
            }
            monitoring.store(false, Ordering::SeqCst);
        });
    if let Err(e) = spawned {
        error!("Failed to start device monitor: {}", e);
    }
}

impl AudioBackend for CpalBackend {
    fn activate(&self) -> Result<(), PlaybackError> {
        let device = self.select_device()?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let mut route = self.active_route.lock().unwrap_or_else(|e| e.into_inner());
        if route.as_deref() != Some(name.as_str()) {
            info!("Audio output route: {}", name);
        }
        *route = Some(name);
        Ok(())
    }

    fn deactivate(&self) {
        let mut route = self.active_route.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(name) = route.take() {
            debug!("Released audio output {}", name);
        }
    }

    fn open_player(&self, source: &SoundSource) -> Result<Box<dyn Player>, PlaybackError> {
        let device = self.select_device()?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Output(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let device_rate = config.sample_rate.0;

        let samples = match source {
            SoundSource::Asset { name, path } => {
                let (samples, rate) = load_wav(path)
                    .map_err(|e| PlaybackError::Asset(name.clone(), e))?;
                resample_linear(&samples, rate, device_rate)
            }
            SoundSource::DefaultAlert => {
                resample_linear(&alert_tone(TONE_SAMPLE_RATE), TONE_SAMPLE_RATE, device_rate)
            }
        };
        if samples.is_empty() {
            return Err(PlaybackError::Asset(
                source.name().to_string(),
                "no samples".into(),
            ));
        }

        let player = CpalPlayer::spawn(
            device,
            config,
            sample_format,
            samples,
            self.volume,
            self.report_stream_failure(),
        )?;
        debug!("Opened player for '{}' at {} Hz", source.name(), device_rate);
        Ok(Box::new(player))
    }

    fn beep(&self) {
        // Terminal bell, works even when no audio device is usable
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}

/// Shared between the player handle and its stream callback.
#[derive(Debug)]
struct PlayerState {
    epoch: Instant,
    playing: AtomicBool,
    failed: AtomicBool,
    play_started_ms: AtomicU64,
    last_callback_ms: AtomicU64,
}

impl PlayerState {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            playing: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            play_started_ms: AtomicU64::new(0),
            last_callback_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn mark_callback(&self) {
        self.last_callback_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn is_progressing(&self) -> bool {
        if !self.playing.load(Ordering::Relaxed) || self.failed.load(Ordering::Relaxed) {
            return false;
        }
        let last = self
            .last_callback_ms
            .load(Ordering::Relaxed)
            .max(self.play_started_ms.load(Ordering::Relaxed));
        self.now_ms().saturating_sub(last) < STALL_THRESHOLD_MS
    }
}

enum PlayerCommand {
    Play(mpsc::Sender<Result<(), PlaybackError>>),
    Pause,
    Stop,
}

/// Looping player backed by a cpal output stream on its own thread.
pub struct CpalPlayer {
    commands: mpsc::Sender<PlayerCommand>,
    state: Arc<PlayerState>,
    thread: Option<JoinHandle<()>>,
}

impl CpalPlayer {
    fn spawn(
        device: Device,
        config: StreamConfig,
        sample_format: SampleFormat,
        samples: Vec<f32>,
        volume: f32,
        on_failure: impl Fn() + Send + 'static,
    ) -> Result<Self, PlaybackError> {
        let state = Arc::new(PlayerState::new());
        let (command_tx, command_rx) = mpsc::channel::<PlayerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), PlaybackError>>();

        let thread_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("reveille-player".into())
            .spawn(move || {
                let stream = match build_stream(
                    &device,
                    &config,
                    sample_format,
                    samples,
                    volume,
                    Arc::clone(&thread_state),
                    on_failure,
                ) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    match command {
                        PlayerCommand::Play(reply) => {
                            let result = if thread_state.failed.load(Ordering::SeqCst) {
                                Err(PlaybackError::Stream("stream lost".into()))
                            } else {
                                stream
                                    .play()
                                    .map_err(|e| PlaybackError::Stream(e.to_string()))
                            };
                            if result.is_ok() {
                                thread_state
                                    .play_started_ms
                                    .store(thread_state.now_ms(), Ordering::Relaxed);
                                thread_state.playing.store(true, Ordering::SeqCst);
                            }
                            let _ = reply.send(result);
                        }
                        PlayerCommand::Pause => {
                            if let Err(e) = stream.pause() {
                                debug!("Stream pause failed: {}", e);
                            }
                            thread_state.playing.store(false, Ordering::SeqCst);
                        }
                        PlayerCommand::Stop => break,
                    }
                }

                thread_state.playing.store(false, Ordering::SeqCst);
                drop(stream);
            })
            .map_err(|e| PlaybackError::Output(format!("failed to spawn audio thread: {}", e)))?;

        match ready_rx.recv_timeout(COMMAND_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                commands: command_tx,
                state,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(PlaybackError::Stream(
                "audio thread did not report readiness".into(),
            )),
        }
    }
}

impl Player for CpalPlayer {
    fn play(&mut self) -> Result<(), PlaybackError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(PlayerCommand::Play(reply_tx))
            .map_err(|_| PlaybackError::PlayerGone)?;
        reply_rx
            .recv_timeout(COMMAND_TIMEOUT)
            .map_err(|_| PlaybackError::Stream("audio thread not responding".into()))?
    }

    fn pause(&mut self) {
        let _ = self.commands.send(PlayerCommand::Pause);
    }

    fn stop(&mut self) {
        let _ = self.commands.send(PlayerCommand::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio thread panicked during shutdown");
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.state.is_progressing()
    }
}

impl Drop for CpalPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    samples: Vec<f32>,
    volume: f32,
    state: Arc<PlayerState>,
    on_failure: impl Fn() + Send + 'static,
) -> Result<cpal::Stream, PlaybackError> {
    match sample_format {
        SampleFormat::F32 => {
            build_typed_stream::<f32>(device, config, samples, volume, state, on_failure)
        }
        SampleFormat::I16 => {
            build_typed_stream::<i16>(device, config, samples, volume, state, on_failure)
        }
        SampleFormat::U16 => {
            build_typed_stream::<u16>(device, config, samples, volume, state, on_failure)
        }
        other => Err(PlaybackError::Stream(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }
}

fn build_typed_stream<T>(
    device: &Device,
    config: &StreamConfig,
    samples: Vec<f32>,
    volume: f32,
    state: Arc<PlayerState>,
    on_failure: impl Fn() + Send + 'static,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut position = 0usize;
    let callback_state = Arc::clone(&state);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let value = T::from_sample(samples[position] * volume);
                    for sample in frame.iter_mut() {
                        *sample = value;
                    }
                    position = (position + 1) % samples.len();
                }
                callback_state.mark_callback();
            },
            move |err| {
                error!("Audio stream error: {} - marking for recovery", err);
                state.failed.store(true, Ordering::SeqCst);
                on_failure();
            },
            None,
        )
        .map_err(|e| PlaybackError::Stream(e.to_string()))
}

/// Decode a WAV file into mono f32 samples.
fn load_wav(path: &Path) -> Result<(Vec<f32>, u32), String> {
    let reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string())?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, spec.sample_rate))
}

/// Simple linear resampling
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    let mut result = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let src_idx_floor = (src_idx.floor() as usize).min(samples.len() - 1);
        let src_idx_ceil = (src_idx_floor + 1).min(samples.len() - 1);
        let frac = src_idx - src_idx_floor as f64;

        let sample =
            samples[src_idx_floor] * (1.0 - frac as f32) + samples[src_idx_ceil] * frac as f32;
        result.push(sample);
    }

    result
}

/// One second of the built-in alert: two short high tones, then silence.
fn alert_tone(sample_rate: u32) -> Vec<f32> {
    let rate = sample_rate as f32;
    let total = sample_rate as usize;
    let tone_len = (rate * 0.15) as usize;
    let gap = (rate * 0.05) as usize;

    (0..total)
        .map(|i| {
            let (freq, offset) = if i < tone_len {
                (880.0, i)
            } else if i >= tone_len + gap && i < 2 * tone_len + gap {
                (1046.5, i - tone_len - gap)
            } else {
                return 0.0;
            };
            let t = offset as f32 / rate;
            // Short linear fade in/out to avoid clicks
            let envelope = (offset.min(tone_len - offset) as f32 / (rate * 0.005)).min(1.0);
            (2.0 * std::f32::consts::PI * freq * t).sin() * 0.6 * envelope
        })
        .collect()
}
