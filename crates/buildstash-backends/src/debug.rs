//! Debug-logging decorator
//!
//! Wraps any backend and logs every operation with its duration and
//! outcome, keeping the logging concern out of the backend implementations.

use async_trait::async_trait;
use buildstash_core::{Backend, Fetch, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Backend decorator that logs operations at debug level.
pub struct DebugBackend {
    inner: Arc<dyn Backend>,
}

impl DebugBackend {
    #[must_use]
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Backend for DebugBackend {
    async fn put(
        &self,
        action_id: &[u8],
        output_id: &[u8],
        body: Bytes,
        size: u64,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.put(action_id, output_id, body, size).await;
        match &result {
            Ok(()) => debug!(
                action_id = %hex::encode(action_id),
                output_id = %hex::encode(output_id),
                size,
                duration_ms = start.elapsed().as_millis() as u64,
                "backend put"
            ),
            Err(err) => debug!(
                action_id = %hex::encode(action_id),
                error = %err,
                duration_ms = start.elapsed().as_millis() as u64,
                "backend put failed"
            ),
        }
        result
    }

    async fn get(&self, action_id: &[u8]) -> Result<Fetch> {
        let start = Instant::now();
        let result = self.inner.get(action_id).await;
        match &result {
            Ok(Fetch::Hit(hit)) => debug!(
                action_id = %hex::encode(action_id),
                output_id = %hex::encode(&hit.output_id),
                size = hit.size,
                duration_ms = start.elapsed().as_millis() as u64,
                "backend get hit"
            ),
            Ok(Fetch::Miss) => debug!(
                action_id = %hex::encode(action_id),
                duration_ms = start.elapsed().as_millis() as u64,
                "backend get miss"
            ),
            Err(err) => debug!(
                action_id = %hex::encode(action_id),
                error = %err,
                duration_ms = start.elapsed().as_millis() as u64,
                "backend get failed"
            ),
        }
        result
    }

    async fn close(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.close().await;
        debug!(
            ok = result.is_ok(),
            duration_ms = start.elapsed().as_millis() as u64,
            "backend close"
        );
        result
    }

    async fn clear(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.clear().await;
        debug!(
            ok = result.is_ok(),
            duration_ms = start.elapsed().as_millis() as u64,
            "backend clear"
        );
        result
    }
}
