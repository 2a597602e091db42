//! Storage-backend contract consumed by the broker
//!
//! Backends abstract remote or large storage behind a narrow capability
//! set. The broker guarantees at most one in-flight operation per command
//! and action ID (single-flight, plus advisory locks across processes), so
//! implementations need no per-key locking of their own; they must still be
//! safe for concurrent calls on distinct action IDs.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

/// Body bytes streamed out of a backend on a hit. The caller drains the
/// stream into the local cache and drops it when done.
pub type BodyStream = Box<dyn AsyncRead + Send + Unpin>;

/// A successful backend lookup.
pub struct FetchHit {
    /// Opaque bytes stored alongside the body
    pub output_id: Vec<u8>,
    /// Body length in bytes
    pub size: u64,
    /// When the entry was stored
    pub stored_at: DateTime<Utc>,
    /// The body bytes
    pub body: BodyStream,
}

/// Outcome of a backend lookup.
pub enum Fetch {
    /// No entry for the action ID
    Miss,
    /// Entry found; body must be drained by the caller
    Hit(FetchHit),
}

/// A pluggable storage backend.
///
/// The contract says nothing about persistence medium, durability, or
/// ordering between backends and the local cache. Decorators (debug
/// logging, fault injection) implement the same trait around an inner
/// backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store a body under `action_id`. Idempotent over retries.
    async fn put(
        &self,
        action_id: &[u8],
        output_id: &[u8],
        body: Bytes,
        size: u64,
    ) -> Result<()>;

    /// Look up `action_id`.
    async fn get(&self, action_id: &[u8]) -> Result<Fetch>;

    /// Release backend-owned resources. Called once, after the broker has
    /// drained all in-flight requests.
    async fn close(&self) -> Result<()>;

    /// Remove every entry the backend manages.
    async fn clear(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Backend")
    }
}
