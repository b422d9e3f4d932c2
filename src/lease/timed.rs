//! Lease provider backed by tokio timers.
//!
//! Desktop systems do not cap background time, so the grant is simulated:
//! each lease lasts a fixed duration and the expiry warning fires a margin
//! before it runs out. This keeps the renewal path exercised the same way
//! on every platform.

use super::{ExpiryCallback, LeaseError, LeaseProvider, LeaseToken};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct Grant {
    name: String,
    expires_at: Instant,
    warning: JoinHandle<()>,
}

pub struct TimedLeaseProvider {
    runtime: Handle,
    duration: Duration,
    expiry_margin: Duration,
    next_token: AtomicU64,
    grants: Arc<Mutex<HashMap<LeaseToken, Grant>>>,
}

fn lock(grants: &Mutex<HashMap<LeaseToken, Grant>>) -> MutexGuard<'_, HashMap<LeaseToken, Grant>> {
    grants.lock().unwrap_or_else(|e| e.into_inner())
}

impl TimedLeaseProvider {
    /// Must be called inside a tokio runtime.
    pub fn new(duration: Duration, expiry_margin: Duration) -> Self {
        Self {
            runtime: Handle::current(),
            duration,
            expiry_margin,
            next_token: AtomicU64::new(1),
            grants: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of grants not yet ended.
    pub fn active_grants(&self) -> usize {
        lock(&self.grants).len()
    }
}

impl LeaseProvider for TimedLeaseProvider {
    fn begin(&self, name: &str, on_expiry: ExpiryCallback) -> Result<LeaseToken, LeaseError> {
        if self.duration.is_zero() {
            return Err(LeaseError::Denied("zero lease duration".into()));
        }

        let token = LeaseToken::new(self.next_token.fetch_add(1, Ordering::Relaxed));
        let warn_after = self.duration.saturating_sub(self.expiry_margin);

        let mut grants = lock(&self.grants);
        let warning = {
            let grants = Arc::clone(&self.grants);
            self.runtime.spawn(async move {
                tokio::time::sleep(warn_after).await;
                // Ended leases never report expiry
                let still_granted = lock(&grants).contains_key(&token);
                if still_granted {
                    debug!("{} about to expire", token);
                    on_expiry(token);
                }
            })
        };
        grants.insert(
            token,
            Grant {
                name: name.to_string(),
                expires_at: Instant::now() + self.duration,
                warning,
            },
        );

        debug!("Granted {} for '{}' ({:?})", token, name, self.duration);
        Ok(token)
    }

    fn end(&self, token: LeaseToken) {
        if let Some(grant) = lock(&self.grants).remove(&token) {
            grant.warning.abort();
            debug!("Ended {} for '{}'", token, grant.name);
        }
    }

    fn remaining(&self, token: LeaseToken) -> Option<Duration> {
        lock(&self.grants)
            .get(&token)
            .map(|grant| grant.expires_at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for TimedLeaseProvider {
    fn drop(&mut self) {
        for (_, grant) in lock(&self.grants).drain() {
            grant.warning.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_before_end_of_grant() {
        let provider = TimedLeaseProvider::new(Duration::from_secs(30), Duration::from_secs(5));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let token = provider
            .begin("alarm", Box::new(move |_| flag.store(true, Ordering::SeqCst)))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(24)).await;
        assert!(!fired.load(Ordering::SeqCst));
        let remaining = provider.remaining(token).unwrap();
        assert!(remaining <= Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_expiry_reports_granted_token() {
        // Margin as long as the grant: the warning is due at once
        let provider = TimedLeaseProvider::new(Duration::from_secs(5), Duration::from_secs(5));
        let reported = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&reported);

        let token = provider
            .begin("alarm", Box::new(move |token| *slot.lock().unwrap() = Some(token)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*reported.lock().unwrap(), Some(token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_lease_never_expires() {
        let provider = TimedLeaseProvider::new(Duration::from_secs(10), Duration::from_secs(2));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let token = provider
            .begin("alarm", Box::new(move |_| flag.store(true, Ordering::SeqCst)))
            .unwrap();
        provider.end(token);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(provider.remaining(token), None);
        assert_eq!(provider.active_grants(), 0);
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let provider = TimedLeaseProvider::new(Duration::from_secs(60), Duration::from_secs(5));
        let a = provider.begin("a", Box::new(|_| {})).unwrap();
        let b = provider.begin("b", Box::new(|_| {})).unwrap();
        assert_ne!(a, b);
        assert_eq!(provider.active_grants(), 2);
    }

    #[tokio::test]
    async fn test_zero_duration_denied() {
        let provider = TimedLeaseProvider::new(Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            provider.begin("alarm", Box::new(|_| {})),
            Err(LeaseError::Denied(_))
        ));
    }
}
