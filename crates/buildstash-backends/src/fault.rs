//! Fault-injection decorator
//!
//! Wraps any backend and fails a configured fraction of operations. Used by
//! the `--error-rate` flag and by tests exercising the broker's error
//! handling and retry paths.

use async_trait::async_trait;
use buildstash_core::{Backend, Error, Fetch, Result};
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-operation counts of injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultCounts {
    pub puts: u64,
    pub gets: u64,
    pub closes: u64,
    pub clears: u64,
}

/// Backend decorator that randomly injects errors.
pub struct FaultBackend {
    inner: Arc<dyn Backend>,
    error_rate: f64,
    put_errors: AtomicU64,
    get_errors: AtomicU64,
    close_errors: AtomicU64,
    clear_errors: AtomicU64,
}

impl FaultBackend {
    /// Wrap `inner`, failing `error_rate` of operations. The rate is
    /// clamped to `[0.0, 1.0]`.
    #[must_use]
    pub fn new(inner: Arc<dyn Backend>, error_rate: f64) -> Self {
        Self {
            inner,
            error_rate: error_rate.clamp(0.0, 1.0),
            put_errors: AtomicU64::new(0),
            get_errors: AtomicU64::new(0),
            close_errors: AtomicU64::new(0),
            clear_errors: AtomicU64::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        rand::rng().random::<f64>() < self.error_rate
    }

    fn injected(&self, operation: &str, counter: &AtomicU64) -> Error {
        counter.fetch_add(1, Ordering::Relaxed);
        Error::backend(format!(
            "fault backend: simulated {operation} error (error rate: {:.2}%)",
            self.error_rate * 100.0
        ))
    }

    /// Number of errors injected so far, per operation.
    #[must_use]
    pub fn counts(&self) -> FaultCounts {
        FaultCounts {
            puts: self.put_errors.load(Ordering::Relaxed),
            gets: self.get_errors.load(Ordering::Relaxed),
            closes: self.close_errors.load(Ordering::Relaxed),
            clears: self.clear_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Backend for FaultBackend {
    async fn put(
        &self,
        action_id: &[u8],
        output_id: &[u8],
        body: Bytes,
        size: u64,
    ) -> Result<()> {
        if self.should_fail() {
            return Err(self.injected("put", &self.put_errors));
        }
        self.inner.put(action_id, output_id, body, size).await
    }

    async fn get(&self, action_id: &[u8]) -> Result<Fetch> {
        if self.should_fail() {
            return Err(self.injected("get", &self.get_errors));
        }
        self.inner.get(action_id).await
    }

    async fn close(&self) -> Result<()> {
        if self.should_fail() {
            return Err(self.injected("close", &self.close_errors));
        }
        self.inner.close().await
    }

    async fn clear(&self) -> Result<()> {
        if self.should_fail() {
            return Err(self.injected("clear", &self.clear_errors));
        }
        self.inner.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopBackend;

    fn wrapped(rate: f64) -> FaultBackend {
        FaultBackend::new(Arc::new(NoopBackend::new()), rate)
    }

    #[tokio::test]
    async fn zero_rate_never_fails() {
        let backend = wrapped(0.0);
        for i in 0..32u8 {
            backend
                .put(&[i], &[i], Bytes::from_static(b"x"), 1)
                .await
                .unwrap();
        }
        assert_eq!(backend.counts(), FaultCounts::default());
    }

    #[tokio::test]
    async fn full_rate_always_fails_and_counts() {
        let backend = wrapped(1.0);
        for i in 0..4u8 {
            assert!(backend.put(&[i], &[i], Bytes::new(), 0).await.is_err());
            assert!(backend.get(&[i]).await.is_err());
        }
        assert!(backend.close().await.is_err());
        assert!(backend.clear().await.is_err());

        let counts = backend.counts();
        assert_eq!(counts.puts, 4);
        assert_eq!(counts.gets, 4);
        assert_eq!(counts.closes, 1);
        assert_eq!(counts.clears, 1);
    }

    #[test]
    fn rate_is_clamped() {
        assert!(!wrapped(-3.0).should_fail());
        assert!(wrapped(7.0).should_fail());
    }
}
