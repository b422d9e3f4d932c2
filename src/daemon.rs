//! Background daemon delivering alarms.
//!
//! The daemon:
//! 1. Loads config, the alarm store and persisted engine state
//! 2. Wires the desktop adapters (timer triggers, cpal audio, timed leases)
//! 3. Restores an alarm that was firing when the last process died
//! 4. Arms every enabled alarm
//! 5. Feeds platform events to the engine and serves IPC commands

use crate::alarm::{next_occurrence, Alarm, AlarmId};
use crate::config::Config;
use crate::engine::{
    event_channel, AlarmEngine, EngineParts, EngineSettings, EventReceiver, ReconcileOutcome,
};
use crate::ipc::{self, IpcCommand, IpcResponse, IpcServer, IpcServerHandle};
use crate::lease::TimedLeaseProvider;
use crate::playback::{CpalBackend, SoundCatalog};
use crate::state::StateFile;
use crate::store::{AlarmStore, JsonAlarmStore};
use crate::trigger::TimerTriggerCenter;
use chrono::{Local, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Alarm store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("State error: {0}")]
    State(#[from] crate::state::StateError),

    #[error("IPC error: {0}")]
    Ipc(#[from] crate::ipc::IpcError),

    #[error("Daemon already running")]
    AlreadyRunning,

    #[error("Daemon not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main daemon struct
pub struct Daemon {
    engine: AlarmEngine,
    store: Arc<dyn AlarmStore>,
    events: EventReceiver,
}

impl Daemon {
    /// Create a new daemon instance. Must be called inside a tokio runtime.
    pub fn new(config: &Config) -> Result<Self, DaemonError> {
        let store: Arc<dyn AlarmStore> = Arc::new(JsonAlarmStore::open_default()?);
        let state = Arc::new(StateFile::open(StateFile::default_path()?));
        let (tx, events) = event_channel();

        let catalog = SoundCatalog::scan(
            config.playback.sounds_dir()?,
            &config.playback.preferred_sounds,
        );
        let parts = EngineParts {
            trigger_center: Arc::new(TimerTriggerCenter::new(
                tx.clone(),
                config.notifications.enabled,
            )),
            audio: Arc::new(CpalBackend::new(
                config.playback.volume,
                config.playback.output_device.clone(),
                Some(tx.clone()),
            )),
            leases: Arc::new(TimedLeaseProvider::new(
                config.lease.duration(),
                config.lease.expiry_margin(),
            )),
            store: Arc::clone(&store),
            state,
            catalog,
        };

        let engine = AlarmEngine::new(parts, EngineSettings::from_config(config), tx);
        Ok(Self {
            engine,
            store,
            events,
        })
    }

    /// Main daemon loop
    pub async fn run_loop(&mut self) -> Result<(), DaemonError> {
        info!("Reveille daemon started (v{})", env!("CARGO_PKG_VERSION"));

        if let Some(alarm_id) = self.engine.restore_from_state() {
            warn!("Alarm {} was firing when the daemon last stopped", alarm_id);
        }
        match self.engine.foreground() {
            ReconcileOutcome::NoAction => {}
            outcome => info!("Startup reconcile: {:?}", outcome),
        }

        let armed = arm_all(&self.engine, self.store.as_ref());
        info!("{} alarm(s) armed", armed);

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
        let mut ipc_handle = {
            let engine = self.engine.clone();
            let store = Arc::clone(&self.store);
            let server = IpcServer::new()?;
            IpcServerHandle::spawn(server, move |cmd| {
                handle_command(&engine, store.as_ref(), cmd, &shutdown_tx)
            })?
        };

        let mut sigterm = signal(SignalKind::terminate())?;

        // Main event loop
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    debug!("Engine event: {:?}", event);
                    self.engine.dispatch(event);
                }

                Some(()) = shutdown_rx.recv() => {
                    info!("Stop requested over IPC");
                    break;
                }

                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }

                // Handle shutdown signal
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        ipc_handle.shutdown();
        self.engine.shutdown();
        info!("Daemon stopped");
        Ok(())
    }
}

/// Arm every enabled alarm, moving past recurring alarms to their next
/// occurrence. Returns the number armed.
pub fn arm_all(engine: &AlarmEngine, store: &dyn AlarmStore) -> usize {
    let now = Utc::now();
    let mut armed = 0;

    for mut alarm in store.list() {
        if !alarm.enabled {
            continue;
        }
        if alarm.time <= now {
            if alarm.is_one_shot() {
                debug!("One-shot alarm {} is in the past, not arming", alarm.id);
                continue;
            }
            let time_of_day = alarm.time.with_timezone(&Local).time();
            let Some(next) = next_occurrence(time_of_day, Local::now()) else {
                warn!("No next occurrence for alarm {}", alarm.id);
                continue;
            };
            alarm.time = next;
            if let Err(e) = store.upsert(alarm.clone()) {
                warn!("Failed to update alarm {}: {}", alarm.id, e);
            }
        }
        if engine.on_alarm_armed(&alarm) {
            armed += 1;
        }
    }

    armed
}

/// The alarm a command without an explicit id refers to.
fn resolve_target(engine: &AlarmEngine, alarm_id: Option<AlarmId>) -> Option<AlarmId> {
    alarm_id.or_else(|| engine.current().map(|f| f.alarm_id))
}

/// Execute one IPC command against the engine.
pub fn handle_command(
    engine: &AlarmEngine,
    store: &dyn AlarmStore,
    cmd: IpcCommand,
    shutdown: &mpsc::UnboundedSender<()>,
) -> IpcResponse {
    match cmd {
        IpcCommand::Status => IpcResponse::status(engine.status()),
        IpcCommand::Ping => IpcResponse::pong(),
        IpcCommand::Stop => {
            let _ = shutdown.send(());
            IpcResponse::ok()
        }
        IpcCommand::Arm { alarm_id } => match store.get(&alarm_id) {
            Some(alarm) => IpcResponse::armed(engine.on_alarm_armed(&alarm)),
            None => IpcResponse::error(&format!("Alarm not found: {}", alarm_id)),
        },
        IpcCommand::Disarm { alarm_id } => {
            engine.on_alarm_disarmed(&alarm_id);
            IpcResponse::ok()
        }
        IpcCommand::Test { alarm_id } => match store.get(&alarm_id) {
            Some(alarm) => {
                engine.start_now(&alarm);
                IpcResponse::ok()
            }
            None => IpcResponse::error(&format!("Alarm not found: {}", alarm_id)),
        },
        IpcCommand::Open { alarm_id } => match resolve_target(engine, alarm_id) {
            Some(id) if engine.open(&id) => IpcResponse::ok(),
            Some(id) => IpcResponse::error(&format!("Alarm {} cannot be opened", id)),
            None => IpcResponse::error("No alarm is firing"),
        },
        IpcCommand::Dismiss { alarm_id } => match resolve_target(engine, alarm_id) {
            Some(id) => IpcResponse::dismissed(engine.dismiss(&id)),
            None => IpcResponse::error("No alarm is firing"),
        },
        IpcCommand::Snooze { alarm_id } => match resolve_target(engine, alarm_id) {
            Some(id) => match engine.snooze(&id) {
                Some(snoozed) => IpcResponse::snoozed(snoozed.id, snoozed.time),
                None => IpcResponse::error(&format!("Alarm {} is not firing", id)),
            },
            None => IpcResponse::error("No alarm is firing"),
        },
        IpcCommand::Foreground => IpcResponse::reconciled(engine.foreground()),
    }
}

/// Get the PID file path
fn pid_file() -> Result<PathBuf, DaemonError> {
    let runtime_dir = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or(DaemonError::Config(crate::config::ConfigError::NoConfigDir))?;

    Ok(runtime_dir.join("reveille.pid"))
}

fn read_pid() -> Option<i32> {
    let path = pid_file().ok()?;
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Check if daemon is already running
pub fn is_running() -> bool {
    read_pid().is_some_and(process_alive)
}

/// Write PID file
fn write_pid() -> Result<(), DaemonError> {
    let path = pid_file()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, std::process::id().to_string())?;
    Ok(())
}

/// Remove PID file
fn remove_pid() -> Result<(), DaemonError> {
    let path = pid_file()?;
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

/// Start the daemon
pub async fn run(config: Config, foreground: bool) -> Result<(), DaemonError> {
    if is_running() {
        return Err(DaemonError::AlreadyRunning);
    }

    if !foreground {
        warn!("Background mode not yet implemented, running in foreground");
    }

    write_pid()?;

    let result = match Daemon::new(&config) {
        Ok(mut daemon) => daemon.run_loop().await,
        Err(e) => Err(e),
    };

    remove_pid()?;

    result
}

/// Stop the daemon
pub async fn stop() -> Result<(), DaemonError> {
    let Some(pid) = read_pid().filter(|pid| process_alive(*pid)) else {
        return Err(DaemonError::NotRunning);
    };

    // Prefer an orderly shutdown over IPC
    if ipc::request(IpcCommand::Stop).is_ok() {
        info!("Asked daemon to stop (PID: {})", pid);
        return Ok(());
    }

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| DaemonError::Io(std::io::Error::from(e)))?;
    info!("Sent SIGTERM to daemon (PID: {})", pid);

    Ok(())
}

/// Check daemon status
pub async fn status() -> Result<(), DaemonError> {
    let Some(pid) = read_pid().filter(|pid| process_alive(*pid)) else {
        println!("Reveille daemon is not running");
        return Ok(());
    };

    println!("Reveille daemon is running (PID: {})", pid);

    let response = match ipc::request(IpcCommand::Status) {
        Ok(response) => response,
        Err(e) => {
            error!("Could not query daemon: {}", e);
            return Ok(());
        }
    };
    let Some(ipc::IpcResponseData::Status(status)) = response.data else {
        return Ok(());
    };

    let engine = status.engine;
    match engine.firing {
        Some(firing) => {
            println!(
                "Firing:    {} ({}, {})",
                if firing.label.is_empty() { "Alarm" } else { &firing.label },
                firing.alarm_id,
                firing.phase
            );
            println!(
                "Sound:     {}{}",
                engine.sound.as_deref().unwrap_or("none"),
                if engine.playing { "" } else { " (not producing output)" }
            );
            if engine.interrupted {
                println!("Audio:     interrupted");
            }
            if let Some(secs) = engine.lease_remaining_secs {
                println!("Lease:     {}s remaining", secs);
            }
        }
        None => println!("Firing:    nothing"),
    }
    println!("Pending:   {} trigger(s)", engine.pending_triggers);

    Ok(())
}

/// Look up an alarm by full id or unambiguous id prefix.
pub fn find_alarm(store: &dyn AlarmStore, id: &str) -> Option<Alarm> {
    let id = AlarmId::from(id);
    store.get(&id).or_else(|| {
        // Accept unambiguous id prefixes
        let matches: Vec<Alarm> = store
            .list()
            .into_iter()
            .filter(|a| a.id.as_str().starts_with(id.as_str()))
            .collect();
        if matches.len() == 1 {
            matches.into_iter().next()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::Harness;
    use crate::engine::{DismissOutcome, EngineSettings};
    use crate::ipc::IpcResponseData;

    fn harness_with(alarm: &Alarm) -> Harness {
        let h = Harness::new(EngineSettings::default());
        h.store.upsert(alarm.clone()).unwrap();
        h
    }

    fn handle(h: &Harness, cmd: IpcCommand) -> IpcResponse {
        let (tx, _rx) = mpsc::unbounded_channel();
        handle_command(&h.engine, h.store.as_ref(), cmd, &tx)
    }

    #[tokio::test]
    async fn test_arm_all_rolls_recurring_forward() {
        let past = Alarm::new(Utc::now() - chrono::Duration::hours(2), "Daily", "radar");
        let missed = Alarm::one_shot(Utc::now() - chrono::Duration::hours(2), "Once", "radar");
        let mut disabled = Alarm::new(Utc::now() + chrono::Duration::hours(2), "Off", "radar");
        disabled.enabled = false;

        let h = Harness::new(EngineSettings::default());
        for a in [&past, &missed, &disabled] {
            h.store.upsert(a.clone()).unwrap();
        }

        assert_eq!(arm_all(&h.engine, h.store.as_ref()), 1);
        let rolled = h.store.get(&past.id).unwrap();
        assert!(rolled.time > Utc::now());
        assert!(rolled.time <= Utc::now() + chrono::Duration::hours(24));
        assert_eq!(h.engine.status().pending_triggers, 20);
    }

    #[tokio::test]
    async fn test_ipc_test_dismiss_flow() {
        let alarm = Alarm::new(Utc::now() + chrono::Duration::hours(1), "Work", "radar");
        let h = harness_with(&alarm);

        assert!(handle(&h, IpcCommand::Test { alarm_id: alarm.id.clone() }).ok);
        assert!(h.engine.is_firing(&alarm.id));

        // No id means the firing alarm
        let response = handle(&h, IpcCommand::Dismiss { alarm_id: None });
        assert!(matches!(
            response.data,
            Some(IpcResponseData::Dismissed { outcome: DismissOutcome::Dismissed })
        ));

        let response = handle(&h, IpcCommand::Dismiss { alarm_id: None });
        assert!(!response.ok);

        let response = handle(
            &h,
            IpcCommand::Dismiss {
                alarm_id: Some(alarm.id.clone()),
            },
        );
        assert!(matches!(
            response.data,
            Some(IpcResponseData::Dismissed { outcome: DismissOutcome::AlreadyDismissed })
        ));
    }

    #[tokio::test]
    async fn test_ipc_snooze() {
        let alarm = Alarm::new(Utc::now() + chrono::Duration::hours(1), "Work", "radar");
        let h = harness_with(&alarm);

        assert!(!handle(&h, IpcCommand::Snooze { alarm_id: None }).ok);

        handle(&h, IpcCommand::Test { alarm_id: alarm.id.clone() });
        let response = handle(&h, IpcCommand::Snooze { alarm_id: None });
        match response.data {
            Some(IpcResponseData::Snoozed { alarm_id, until }) => {
                assert_ne!(alarm_id, alarm.id);
                assert!(until > Utc::now());
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ipc_arm_alarm_added_by_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        let daemon_store = JsonAlarmStore::open(&path).unwrap();
        let cli_store = JsonAlarmStore::open(&path).unwrap();

        let h = Harness::new(EngineSettings::default());
        let alarm = Alarm::new(Utc::now() + chrono::Duration::hours(1), "Work", "radar");
        cli_store.upsert(alarm.clone()).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let response = handle_command(
            &h.engine,
            &daemon_store,
            IpcCommand::Arm {
                alarm_id: alarm.id.clone(),
            },
            &tx,
        );
        assert!(matches!(
            response.data,
            Some(IpcResponseData::Armed { armed: true })
        ));
        assert_eq!(h.engine.status().pending_triggers, 20);
    }

    #[tokio::test]
    async fn test_ipc_arm_unknown_alarm() {
        let h = Harness::new(EngineSettings::default());
        let response = handle(
            &h,
            IpcCommand::Arm {
                alarm_id: AlarmId::from("nope"),
            },
        );
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn test_ipc_stop_signals_shutdown() {
        let h = Harness::new(EngineSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let response = handle_command(&h.engine, h.store.as_ref(), IpcCommand::Stop, &tx);
        assert!(response.ok);
        assert_eq!(rx.try_recv(), Ok(()));
    }

    #[test]
    fn test_find_alarm_by_prefix() {
        let store = crate::store::MemoryAlarmStore::new();
        let alarm = Alarm::new(Utc::now(), "Work", "radar");
        store.upsert(alarm.clone()).unwrap();

        let prefix = &alarm.id.as_str()[..8];
        assert_eq!(find_alarm(&store, prefix).unwrap().id, alarm.id);
        assert!(find_alarm(&store, "zzzz").is_none());
    }
}
