//! Background execution leases.
//!
//! A lease is a time-boxed grant to keep running while an alarm fires. The
//! provider may warn of expiry early; the warning is delivered as an engine
//! event and answered with a renewal, it is never treated as an error.

pub mod timed;

pub use timed::TimedLeaseProvider;

use crate::engine::{EngineEvent, EventSender};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Execution lease denied: {0}")]
    Denied(String),

    #[error("Lease provider is shut down")]
    ShutDown,
}

/// Handle of one granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

impl LeaseToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease#{}", self.0)
    }
}

/// Called with the token of the lease about to expire.
pub type ExpiryCallback = Box<dyn FnOnce(LeaseToken) + Send + 'static>;

/// Platform grant of background execution time.
pub trait LeaseProvider: Send + Sync {
    /// Request a lease. `on_expiry` may be called shortly before the grant
    /// runs out, possibly before `begin` returns; it is not called after
    /// [`end`](Self::end).
    fn begin(&self, name: &str, on_expiry: ExpiryCallback) -> Result<LeaseToken, LeaseError>;

    fn end(&self, token: LeaseToken);

    /// Time left on the grant, `None` if the token is no longer valid.
    fn remaining(&self, token: LeaseToken) -> Option<Duration>;
}

/// Holds at most one lease for the firing session.
pub struct LeaseManager {
    provider: Arc<dyn LeaseProvider>,
    events: EventSender,
    current: Option<LeaseToken>,
}

impl LeaseManager {
    pub fn new(provider: Arc<dyn LeaseProvider>, events: EventSender) -> Self {
        Self {
            provider,
            events,
            current: None,
        }
    }

    /// Request a lease unless one is already held. Expiry is reported as
    /// [`EngineEvent::LeaseExpired`].
    pub fn acquire(&mut self, name: &str) -> Result<LeaseToken, LeaseError> {
        if let Some(token) = self.current {
            return Ok(token);
        }

        let events = self.events.clone();
        let on_expiry: ExpiryCallback = Box::new(move |token| {
            let _ = events.send(EngineEvent::LeaseExpired(token));
        });

        let token = self.provider.begin(name, on_expiry)?;
        debug!("Acquired {} ({})", token, name);
        self.current = Some(token);
        Ok(token)
    }

    /// Release the current lease and request a fresh one.
    pub fn renew(&mut self, name: &str) -> Result<LeaseToken, LeaseError> {
        self.release();
        self.acquire(name)
    }

    /// Release the current lease if any. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(token) = self.current.take() {
            self.provider.end(token);
            debug!("Released {}", token);
        }
    }

    pub fn current(&self) -> Option<LeaseToken> {
        self.current
    }

    pub fn is_held(&self) -> bool {
        self.current.is_some()
    }

    /// True when `token` is the lease currently held.
    pub fn is_current(&self, token: LeaseToken) -> bool {
        self.current == Some(token)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.current.and_then(|t| self.provider.remaining(t))
    }

    /// Answer an expiry warning. Stale tokens are ignored.
    pub fn handle_expiry(&mut self, token: LeaseToken, name: &str) -> Option<LeaseToken> {
        if !self.is_current(token) {
            debug!("Ignoring expiry of stale {}", token);
            return None;
        }
        match self.renew(name) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Lease renewal after expiry failed: {}", e);
                None
            }
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.release();
    }
}
