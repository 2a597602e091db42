//! In-process call coalescing
//!
//! Only one execution is in flight per key at a time. Duplicate callers
//! wait on the leader's completion signal and receive the same result; the
//! `shared` flag tells callers their result was produced by another call.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Result published to every caller of a coalesced call. Errors are shared
/// by reference since waiters all observe the same failure.
pub type FlightResult<T> = std::result::Result<T, Arc<Error>>;

type Slot<T> = Option<FlightResult<T>>;

/// Per-key single-flight group.
///
/// The in-flight map is guarded by a short mutex; call bodies always run
/// outside it. The completion signal is a `watch` channel: if the leader's
/// future is dropped or panics before publishing, the channel closes and
/// waiters observe an abandoned flight instead of hanging.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, watch::Receiver<Slot<T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Execute `f` for `key`, unless an identical call is already running,
    /// in which case wait for it and share its result. Returns the result
    /// and whether it was shared from another caller's execution.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> (FlightResult<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let role = {
            let mut calls = self.lock_calls();
            match calls.get(key) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(slot) => (*slot)
                        .clone()
                        .unwrap_or_else(|| Err(Arc::new(Error::flight_abandoned(key)))),
                    Err(_) => Err(Arc::new(Error::flight_abandoned(key))),
                };
                (outcome, true)
            }
            Role::Leader(tx) => {
                // The guard removes the map entry on every exit path; if the
                // future is dropped mid-call the sender drops with it, which
                // closes the channel and releases the waiters.
                let guard = FlightGuard {
                    calls: &self.calls,
                    key,
                };
                let outcome = match f().await {
                    Ok(value) => Ok(value),
                    Err(err) => Err(Arc::new(err)),
                };
                drop(guard);
                let _ = tx.send(Some(outcome.clone()));
                (outcome, false)
            }
        }
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Receiver<Slot<T>>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock_calls().len()
    }
}

enum Role<T> {
    Leader(watch::Sender<Slot<T>>),
    Waiter(watch::Receiver<Slot<T>>),
}

struct FlightGuard<'a, T> {
    calls: &'a Mutex<HashMap<String, watch::Receiver<Slot<T>>>>,
    key: &'a str,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}
