//! Broker statistics
//!
//! Counters are lock-free atomics updated from concurrent handler tasks;
//! exact ordering between counters does not matter, so updates use
//! `Ordering::Relaxed`. The seen-action-ID map sits behind a short mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Counters the broker maintains while serving.
#[derive(Debug, Default)]
pub struct BrokerStats {
    puts: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    duplicate_gets: AtomicU64,
    duplicate_puts: AtomicU64,
    deduplicated_gets: AtomicU64,
    deduplicated_puts: AtomicU64,
    retried_requests: AtomicU64,
    total_retries: AtomicU64,
    seen_action_ids: Mutex<HashMap<String, u64>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub hits: u64,
    pub duplicate_gets: u64,
    pub duplicate_puts: u64,
    pub deduplicated_gets: u64,
    pub deduplicated_puts: u64,
    pub retried_requests: u64,
    pub total_retries: u64,
    pub unique_action_ids: u64,
}

impl BrokerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action ID occurrence and report whether it was seen before.
    fn track(&self, fingerprint: &str) -> bool {
        let mut seen = self
            .seen_action_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = seen.entry(fingerprint.to_string()).or_insert(0);
        *count += 1;
        *count > 1
    }

    /// Record a `get` request; returns whether the action ID is a repeat.
    pub fn record_get(&self, fingerprint: &str) -> bool {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let duplicate = self.track(fingerprint);
        if duplicate {
            self.duplicate_gets.fetch_add(1, Ordering::Relaxed);
        }
        duplicate
    }

    /// Record a `put` request; returns whether the action ID is a repeat.
    pub fn record_put(&self, fingerprint: &str) -> bool {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let duplicate = self.track(fingerprint);
        if duplicate {
            self.duplicate_puts.fetch_add(1, Ordering::Relaxed);
        }
        duplicate
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shared_get(&self) {
        self.deduplicated_gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shared_put(&self) {
        self.deduplicated_puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retry of a request; `first` marks the request's first
    /// retry so retried requests are counted once each.
    pub fn record_retry(&self, first: bool) {
        if first {
            self.retried_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let unique_action_ids = self
            .seen_action_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64;
        StatsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            duplicate_gets: self.duplicate_gets.load(Ordering::Relaxed),
            duplicate_puts: self.duplicate_puts.load(Ordering::Relaxed),
            deduplicated_gets: self.deduplicated_gets.load(Ordering::Relaxed),
            deduplicated_puts: self.deduplicated_puts.load(Ordering::Relaxed),
            retried_requests: self.retried_requests.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            unique_action_ids,
        }
    }

    /// Emit the shutdown summary.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        let misses = s.gets.saturating_sub(s.hits);
        let hit_rate = if s.gets > 0 {
            format!("{:.1}%", s.hits as f64 / s.gets as f64 * 100.0)
        } else {
            "0.0%".to_string()
        };
        info!(
            gets = s.gets,
            hits = s.hits,
            misses,
            hit_rate = %hit_rate,
            puts = s.puts,
            duplicate_gets = s.duplicate_gets,
            duplicate_puts = s.duplicate_puts,
            deduplicated_gets = s.deduplicated_gets,
            deduplicated_puts = s.deduplicated_puts,
            unique_action_ids = s.unique_action_ids,
            retried_requests = s.retried_requests,
            total_retries = s.total_retries,
            "cache statistics"
        );
    }
}
