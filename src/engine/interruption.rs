//! Audio interruption handling.
//!
//! While another party owns the audio output the player is paused in place
//! and the claim is kept. When the interruption ends the same session
//! resumes, or rebuilds its player if resuming is not possible.

use super::gate::EngineCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioInterruption {
    Began,
    Ended,
}

/// Returns true if the session was paused.
pub fn began(core: &mut EngineCore) -> bool {
    let Some(session) = core.session_mut() else {
        debug!("Interruption began with no firing alarm");
        return false;
    };
    session.interrupted = true;
    info!("Audio interrupted, pausing alarm {}", session.alarm_id);
    core.playback.pause();
    true
}

/// Returns true if playback was brought back.
pub fn ended(core: &mut EngineCore) -> bool {
    let Some(session) = core.session_mut() else {
        debug!("Interruption ended with no firing alarm");
        return false;
    };
    session.interrupted = false;
    let alarm_id = session.alarm_id.clone();

    if !core.lifecycle.phase(&alarm_id).is_firing() {
        debug!("Alarm {} no longer firing, not resuming", alarm_id);
        return false;
    }

    if let Err(e) = core.playback.reactivate() {
        warn!("Reactivating audio output failed: {}", e);
    }
    info!("Audio interruption ended, resuming alarm {}", alarm_id);
    core.recover_playback();
    true
}
