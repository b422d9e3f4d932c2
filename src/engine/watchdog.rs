//! Liveness watchdogs bound to one firing session.
//!
//! The short probe checks that the player is still producing output and
//! resumes or rebuilds it if not. The long timer rebuilds the player
//! unconditionally and renews the execution lease, covering failures the
//! probe cannot see, including an audio interruption that never ends. Each tick first checks, under the engine lock, that
//! the session it was started for is still current and exits otherwise.

use super::gate::EngineCore;
use std::sync::{Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug)]
pub struct WatchdogHandles {
    probe: JoinHandle<()>,
    restart: JoinHandle<()>,
}

impl WatchdogHandles {
    pub fn abort(self) {
        self.probe.abort();
        self.restart.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Probe,
    ForcedRestart,
}

pub fn spawn(
    runtime: &Handle,
    core: Weak<Mutex<EngineCore>>,
    generation: u64,
    probe_interval: Duration,
    restart_interval: Duration,
) -> WatchdogHandles {
    WatchdogHandles {
        probe: runtime.spawn(run(core.clone(), generation, probe_interval, Kind::Probe)),
        restart: runtime.spawn(run(core, generation, restart_interval, Kind::ForcedRestart)),
    }
}

fn lock(core: &Mutex<EngineCore>) -> MutexGuard<'_, EngineCore> {
    core.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run(core: Weak<Mutex<EngineCore>>, generation: u64, period: Duration, kind: Kind) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(core) = core.upgrade() else {
            break;
        };
        let mut core = lock(&core);
        if !core.is_current(generation) {
            debug!("{:?} watchdog for session {} is stale, exiting", kind, generation);
            break;
        }

        match kind {
            Kind::Probe => probe(&mut core),
            Kind::ForcedRestart => forced_restart(&mut core),
        }
    }
}

fn probe(core: &mut EngineCore) {
    let interrupted = core.session().is_some_and(|s| s.interrupted);
    let active = core.playback.is_active();

    debug!(
        "Watchdog probe: phase={} active={} interrupted={} lease_remaining={:?}",
        core.phase_of_session()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".into()),
        active,
        interrupted,
        core.lease.remaining()
    );

    if active || interrupted {
        return;
    }

    if core.playback.has_player() {
        info!("Player stalled, resuming");
    } else {
        info!("Player missing, restarting playback");
    }
    core.recover_playback();
}

fn forced_restart(core: &mut EngineCore) {
    // Runs even while interrupted: an interruption whose end is never
    // reported must not leave the alarm silent. The fallback chain ends in
    // the beep, which needs no output device.
    if let Some(session) = core.session_mut().filter(|s| s.interrupted) {
        info!(
            "Interruption of alarm {} outlasted the restart period, forcing playback",
            session.alarm_id
        );
        session.interrupted = false;
    }
    debug!("Forced playback restart");
    core.force_restart();
}
