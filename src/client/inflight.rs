//! In-flight request tracking for request coalescing
//!
//! Maps an operation key to a shared, cloneable future. The first caller
//! registers the work; concurrent callers with the same key clone the same
//! future and observe the same outcome.

use super::outcome::RequestOutcome;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type SharedOutcome = Shared<BoxFuture<'static, RequestOutcome<Value>>>;

/// Whether the caller started the work or joined an existing call.
pub enum Claim {
    Owner(SharedOutcome),
    Joined(SharedOutcome),
}

impl Claim {
    pub fn into_future(self) -> SharedOutcome {
        match self {
            Claim::Owner(fut) | Claim::Joined(fut) => fut,
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Claim::Owner(_))
    }
}

#[derive(Clone, Default)]
pub struct InFlightTracker {
    pending: Arc<Mutex<HashMap<String, SharedOutcome>>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the call registered under `key`, or build one with `start` and
    /// register it. Check and insert happen under one lock, so two racing
    /// callers can never both become owners.
    pub fn join_or_register<F>(&self, key: &str, start: F) -> Claim
    where
        F: FnOnce(InFlightGuard) -> BoxFuture<'static, RequestOutcome<Value>>,
    {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = pending.get(key) {
            return Claim::Joined(existing.clone());
        }
        let guard = InFlightGuard {
            key: key.to_string(),
            tracker: self.clone(),
        };
        let shared = start(guard).shared();
        pending.insert(key.to_string(), shared.clone());
        Claim::Owner(shared)
    }

    pub fn contains(&self, key: &str) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, key: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(key);
    }
}

/// Removes its key from the tracker when dropped, so every exit path of the
/// owning task (success, failure, panic, abort) releases the slot.
pub struct InFlightGuard {
    key: String,
    tracker: InFlightTracker,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.key);
    }
}
