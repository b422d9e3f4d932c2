//! Desktop notifications for delivered triggers.
//!
//! The primed trigger gets an audible, persistent notification with
//! "Stop" and "Snooze" actions. Silent triggers are short-lived visual
//! nudges with no sound hint.

use super::{TriggerDescriptor, TriggerError};
use crate::engine::{EngineEvent, EventSender, TriggerAction};
use tracing::debug;

/// Freedesktop sound theme name used for the primed trigger.
const ALARM_SOUND_HINT: &str = "alarm-clock-elapsed";

/// Shows and withdraws the notifications of delivered triggers.
///
/// Both calls may block on the notification server; callers run them on a
/// blocking-capable thread.
pub trait Notifier: Send + Sync {
    /// Show the notification for a delivered trigger, returning its id when
    /// the platform can close it later.
    fn show(&self, trigger: &TriggerDescriptor) -> Result<Option<u32>, TriggerError>;

    /// Withdraw a notification returned by [`show`](Self::show).
    fn close(&self, id: u32);
}

pub struct DesktopNotifier {
    events: EventSender,
}

impl DesktopNotifier {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

impl Notifier for DesktopNotifier {
    fn show(&self, trigger: &TriggerDescriptor) -> Result<Option<u32>, TriggerError> {
        let payload = &trigger.payload;
        let summary = if payload.label.is_empty() {
            "Alarm".to_string()
        } else {
            payload.label.clone()
        };
        let body = payload
            .base_time
            .with_timezone(&chrono::Local)
            .format("%H:%M")
            .to_string();

        let mut notification = notify_rust::Notification::new();
        notification.summary(&summary).body(&body).appname("Reveille");

        if trigger.primed {
            notification.sound_name(ALARM_SOUND_HINT);
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        let id = {
            use notify_rust::{Hint, Timeout, Urgency};

            if trigger.primed {
                notification
                    .urgency(Urgency::Critical)
                    .hint(Hint::Resident(true))
                    .timeout(Timeout::Never)
                    .action("default", "Open")
                    .action("stop", "Stop")
                    .action("snooze", "Snooze");
            } else {
                notification
                    .hint(Hint::SuppressSound(true))
                    .hint(Hint::Transient(true))
                    .timeout(Timeout::Milliseconds(2500));
            }

            let handle = notification
                .show()
                .map_err(|e| TriggerError::Notification(e.to_string()))?;
            let id = Some(handle.id());

            if trigger.primed {
                let events = self.events.clone();
                let alarm_id = payload.alarm_id.clone();
                std::thread::spawn(move || {
                    handle.wait_for_action(|action| {
                        let action = match action {
                            "default" => TriggerAction::Open,
                            "stop" => TriggerAction::Stop,
                            "snooze" => TriggerAction::Snooze,
                            other => {
                                debug!("Notification closed without action ({})", other);
                                return;
                            }
                        };
                        let _ = events.send(EngineEvent::TriggerAction { alarm_id, action });
                    });
                });
            }
            id
        };

        #[cfg(not(all(unix, not(target_os = "macos"))))]
        let id = {
            let _ = &self.events;
            notification
                .show()
                .map_err(|e| TriggerError::Notification(e.to_string()))?;
            None
        };

        debug!(
            "Notification shown for {} ({})",
            trigger.identifier(),
            if trigger.primed { "primed" } else { "silent" }
        );
        Ok(id)
    }

    /// Replaces the notification with one that expires at once. The server
    /// then reports it closed, which also ends the thread waiting for its
    /// actions.
    #[cfg(all(unix, not(target_os = "macos")))]
    fn close(&self, id: u32) {
        use notify_rust::{Hint, Timeout};

        let result = notify_rust::Notification::new()
            .id(id)
            .summary("Alarm dismissed")
            .appname("Reveille")
            .hint(Hint::SuppressSound(true))
            .hint(Hint::Transient(true))
            .timeout(Timeout::Milliseconds(1))
            .show();
        match result {
            Ok(_) => debug!("Notification {} withdrawn", id),
            Err(e) => debug!("Withdrawing notification {} failed: {}", id, e),
        }
    }

    #[cfg(not(all(unix, not(target_os = "macos"))))]
    fn close(&self, id: u32) {
        debug!("Notification {} cannot be withdrawn on this platform", id);
    }
}
