//! Local-only backend
//!
//! Used when no remote storage is configured: stores succeed without going
//! anywhere and lookups always miss, so the broker's local cache is the
//! only source of hits.

use async_trait::async_trait;
use buildstash_core::{Backend, Fetch, Result};
use bytes::Bytes;

/// Backend that discards stores and misses every lookup.
#[derive(Debug, Default)]
pub struct NoopBackend;

impl NoopBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for NoopBackend {
    async fn put(
        &self,
        _action_id: &[u8],
        _output_id: &[u8],
        _body: Bytes,
        _size: u64,
    ) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _action_id: &[u8]) -> Result<Fetch> {
        Ok(Fetch::Miss)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}
