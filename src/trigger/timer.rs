//! Timer-backed trigger delivery for desktop platforms.
//!
//! Each submitted trigger is a tokio task waiting for its fire time. The
//! tokio clock stops while the machine is suspended, so the task sleeps in
//! short steps and compares against the wall clock after each one. On
//! expiry the trigger moves from pending to delivered, the engine is told
//! through its event queue, and a desktop notification is shown.
//! Withdrawing a delivered trigger closes its notification.

use super::notification::{DesktopNotifier, Notifier};
use super::{TriggerCenter, TriggerDescriptor, TriggerError};
use crate::engine::{EngineEvent, EventSender};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Longest single sleep before the wall clock is consulted again.
pub const WAKE_STEP: Duration = Duration::from_secs(2);

/// Source of wall-clock time.
pub type WallClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct PendingTrigger {
    trigger: TriggerDescriptor,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<String, PendingTrigger>,
    /// Delivered identifiers and the notification shown for each, once known.
    delivered: HashMap<String, Option<u32>>,
}

pub struct TimerTriggerCenter {
    runtime: Handle,
    events: EventSender,
    notifier: Option<Arc<dyn Notifier>>,
    clock: WallClock,
    registry: Arc<Mutex<Registry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

fn until(fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (fire_at - now).to_std().unwrap_or(Duration::ZERO)
}

impl TimerTriggerCenter {
    /// Create a center delivering into `events`. Must be called inside a tokio runtime.
    pub fn new(events: EventSender, notifications: bool) -> Self {
        let notifier = notifications
            .then(|| Arc::new(DesktopNotifier::new(events.clone())) as Arc<dyn Notifier>);
        Self::with_notifier(events, notifier)
    }

    /// Create a center showing delivered triggers through `notifier`.
    pub fn with_notifier(events: EventSender, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            runtime: Handle::current(),
            events,
            notifier,
            clock: Arc::new(Utc::now),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Replace the wall clock fire times are compared against.
    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    fn close_notifications(&self, notifications: Vec<u32>) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if notifications.is_empty() {
            return;
        }
        let notifier = Arc::clone(notifier);
        self.runtime.spawn_blocking(move || {
            for id in notifications {
                notifier.close(id);
            }
        });
    }

    /// Identifiers delivered and not yet withdrawn.
    pub fn delivered_identifiers(&self) -> Vec<String> {
        lock(&self.registry).delivered.keys().cloned().collect()
    }
}

impl TriggerCenter for TimerTriggerCenter {
    fn submit(&self, trigger: TriggerDescriptor) -> Result<(), TriggerError> {
        if self.events.is_closed() {
            return Err(TriggerError::ShutDown);
        }

        let identifier = trigger.identifier();
        let fire_at = trigger.fire_at;
        let delay = until(fire_at, (self.clock)());

        // Holding the registry lock across spawn keeps a zero-delay task
        // from looking itself up before it is registered.
        let mut registry = lock(&self.registry);

        let task = {
            let registry = Arc::clone(&self.registry);
            let events = self.events.clone();
            let notifier = self.notifier.clone();
            let clock = Arc::clone(&self.clock);
            let identifier = identifier.clone();
            self.runtime.spawn(async move {
                loop {
                    let remaining = until(fire_at, clock());
                    if remaining.is_zero() {
                        break;
                    }
                    tokio::time::sleep(remaining.min(WAKE_STEP)).await;
                }

                let trigger = {
                    let mut registry = lock(&registry);
                    match registry.pending.remove(&identifier) {
                        Some(pending) => {
                            registry.delivered.insert(identifier.clone(), None);
                            pending.trigger
                        }
                        None => return,
                    }
                };

                debug!("Delivering trigger {}", identifier);
                if events
                    .send(EngineEvent::TriggerDelivered(trigger.payload.clone()))
                    .is_err()
                {
                    debug!("Engine queue closed, dropping trigger {}", identifier);
                    return;
                }

                let Some(notifier) = notifier else {
                    return;
                };
                let shown = {
                    let notifier = Arc::clone(&notifier);
                    tokio::task::spawn_blocking(move || notifier.show(&trigger)).await
                };
                let notification = match shown {
                    Ok(Ok(Some(id))) => id,
                    Ok(Ok(None)) => return,
                    Ok(Err(e)) => {
                        warn!("Notification for {} failed: {}", identifier, e);
                        return;
                    }
                    Err(e) => {
                        warn!("Notification task for {} failed: {}", identifier, e);
                        return;
                    }
                };

                let withdrawn = {
                    let mut registry = lock(&registry);
                    match registry.delivered.get_mut(&identifier) {
                        Some(slot) => {
                            *slot = Some(notification);
                            false
                        }
                        None => true,
                    }
                };
                if withdrawn {
                    debug!("Trigger {} withdrawn while its notification was shown", identifier);
                    let _ = tokio::task::spawn_blocking(move || notifier.close(notification)).await;
                }
            })
        };

        if let Some(previous) = registry
            .pending
            .insert(identifier.clone(), PendingTrigger { trigger, task })
        {
            previous.task.abort();
        }
        let stale = registry.delivered.remove(&identifier).flatten();
        drop(registry);
        self.close_notifications(stale.into_iter().collect());

        debug!("Scheduled trigger {} in {:?}", identifier, delay);
        Ok(())
    }

    fn remove_pending(&self, identifiers: &[String]) {
        let mut registry = lock(&self.registry);
        for id in identifiers {
            if let Some(pending) = registry.pending.remove(id) {
                pending.task.abort();
            }
        }
    }

    fn remove_delivered(&self, identifiers: &[String]) {
        let notifications: Vec<u32> = {
            let mut registry = lock(&self.registry);
            identifiers
                .iter()
                .filter_map(|id| registry.delivered.remove(id).flatten())
                .collect()
        };

        self.close_notifications(notifications);
    }

    fn pending_identifiers(&self) -> Vec<String> {
        lock(&self.registry).pending.keys().cloned().collect()
    }
}

impl Drop for TimerTriggerCenter {
    fn drop(&mut self) {
        for (_, pending) in lock(&self.registry).pending.drain() {
            pending.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::Alarm;
    use crate::trigger::TriggerBurst;
    use tokio::sync::mpsc;

    fn burst(len: u32, lead: chrono::Duration) -> Vec<TriggerDescriptor> {
        let alarm = Alarm::new(Utc::now() + lead, "Test", "radar");
        TriggerBurst::compute(&alarm, alarm.time, len, Duration::from_secs(3)).into_triggers()
    }

    #[tokio::test]
    async fn test_past_trigger_delivers_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let center = TimerTriggerCenter::new(tx, false);

        let trigger = burst(1, chrono::Duration::seconds(-10)).remove(0);
        let id = trigger.identifier();
        center.submit(trigger).unwrap();

        match rx.recv().await {
            Some(EngineEvent::TriggerDelivered(payload)) => assert_eq!(payload.index, 0),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(center.pending_identifiers().is_empty());
        assert_eq!(center.delivered_identifiers(), vec![id]);
    }

    #[tokio::test]
    async fn test_removed_trigger_never_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let center = TimerTriggerCenter::new(tx, false);

        let triggers = burst(3, chrono::Duration::milliseconds(200));
        let ids: Vec<String> = triggers.iter().map(|t| t.identifier()).collect();
        for t in triggers {
            center.submit(t).unwrap();
        }
        assert_eq!(center.pending_identifiers().len(), 3);

        center.remove_pending(&ids);
        assert!(center.pending_identifiers().is_empty());

        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_err(), "no trigger should be delivered");
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let center = TimerTriggerCenter::new(tx, false);
        drop(rx);

        let trigger = burst(1, chrono::Duration::seconds(60)).remove(0);
        assert!(matches!(center.submit(trigger), Err(TriggerError::ShutDown)));
    }

    #[tokio::test]
    async fn test_resubmit_replaces_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let center = TimerTriggerCenter::new(tx, false);

        let trigger = burst(1, chrono::Duration::seconds(60)).remove(0);
        center.submit(trigger.clone()).unwrap();
        center.submit(trigger).unwrap();
        assert_eq!(center.pending_identifiers().len(), 1);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        shown: Mutex<Vec<String>>,
        closed: Mutex<Vec<u32>>,
    }

    impl RecordingNotifier {
        fn shown(&self) -> Vec<String> {
            self.shown.lock().unwrap().clone()
        }

        fn closed(&self) -> Vec<u32> {
            self.closed.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn show(&self, trigger: &TriggerDescriptor) -> Result<Option<u32>, TriggerError> {
            let mut shown = self.shown.lock().unwrap();
            shown.push(trigger.identifier());
            Ok(Some(100 + shown.len() as u32))
        }

        fn close(&self, id: u32) {
            self.closed.lock().unwrap().push(id);
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_withdrawn_trigger_closes_its_notification() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(RecordingNotifier::default());
        let center =
            TimerTriggerCenter::with_notifier(tx, Some(Arc::clone(&notifier) as Arc<dyn Notifier>));

        let trigger = burst(1, chrono::Duration::seconds(-1)).remove(0);
        let id = trigger.identifier();
        center.submit(trigger).unwrap();
        assert!(matches!(rx.recv().await, Some(EngineEvent::TriggerDelivered(_))));
        wait_until(|| notifier.shown().len() == 1).await;

        center.remove_delivered(&[id]);
        wait_until(|| notifier.closed() == vec![101]).await;
        assert!(center.delivered_identifiers().is_empty());
    }

    #[tokio::test]
    async fn test_pending_removal_leaves_notifications_alone() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(RecordingNotifier::default());
        let center =
            TimerTriggerCenter::with_notifier(tx, Some(Arc::clone(&notifier) as Arc<dyn Notifier>));

        let triggers = burst(2, chrono::Duration::seconds(-4));
        let ids: Vec<String> = triggers.iter().map(|t| t.identifier()).collect();
        for t in triggers {
            center.submit(t).unwrap();
        }
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        wait_until(|| notifier.shown().len() == 2).await;

        center.remove_pending(&ids);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(notifier.closed().is_empty());
        assert_eq!(center.delivered_identifiers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_fires_after_wall_clock_jump() {
        // A suspended machine: the wall clock moves, the tokio clock does not
        let (tx, mut rx) = mpsc::unbounded_channel();
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock: WallClock = {
            let now = Arc::clone(&now);
            Arc::new(move || *now.lock().unwrap())
        };
        let center = TimerTriggerCenter::with_notifier(tx, None).with_clock(clock);

        let trigger = burst(1, chrono::Duration::hours(8)).remove(0);
        center.submit(trigger).unwrap();

        let early = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(early.is_err(), "trigger fired before its time");

        *now.lock().unwrap() += chrono::Duration::hours(8) + chrono::Duration::seconds(1);
        let delivered = tokio::time::timeout(WAKE_STEP * 2, rx.recv()).await;
        assert!(matches!(delivered, Ok(Some(EngineEvent::TriggerDelivered(_)))));
        assert!(center.pending_identifiers().is_empty());
    }
}
