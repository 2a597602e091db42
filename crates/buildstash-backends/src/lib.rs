//! Storage backends for the buildstash agent
//!
//! Implementations of the [`Backend`] contract consumed by the broker:
//!
//! - [`NoopBackend`] — local-only mode; the broker's local cache does all
//!   the work and nothing is stored remotely.
//! - [`S3Backend`] — S3-compatible object store with entry metadata carried
//!   as object metadata.
//!
//! Plus two decorators that wrap any backend: [`DebugBackend`] (operation
//! logging with timings) and [`FaultBackend`] (configurable error injection
//! for resilience testing).

mod debug;
mod fault;
mod noop;
mod s3;

pub use debug::DebugBackend;
pub use fault::FaultBackend;
pub use noop::NoopBackend;
pub use s3::S3Backend;

use buildstash_core::{Backend, Error, Result};
use std::sync::Arc;
use tracing::info;

/// Which storage backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// No remote storage; hits come from the broker's local cache only
    Local,
    /// S3-compatible object store
    S3,
}

/// Backend selection and decorator settings.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub kind: BackendKind,
    /// Bucket name, required for [`BackendKind::S3`]
    pub s3_bucket: Option<String>,
    /// Optional key prefix for all stored objects
    pub s3_prefix: String,
    /// Fraction of operations to fail artificially (0.0 disables)
    pub error_rate: f64,
    /// Wrap the backend with per-operation debug logging
    pub debug: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            s3_bucket: None,
            s3_prefix: String::new(),
            error_rate: 0.0,
            debug: false,
        }
    }
}

/// Build the configured backend, stacking decorators as requested.
pub async fn create_backend(options: &BackendOptions) -> Result<Arc<dyn Backend>> {
    let mut backend: Arc<dyn Backend> = match options.kind {
        BackendKind::Local => Arc::new(NoopBackend::new()),
        BackendKind::S3 => {
            let bucket = options.s3_bucket.as_deref().ok_or_else(|| {
                Error::backend(
                    "S3 bucket is required for the s3 backend (set --s3-bucket or BUILDSTASH_S3_BUCKET)",
                )
            })?;
            Arc::new(S3Backend::connect(bucket, &options.s3_prefix).await?)
        }
    };

    if options.error_rate > 0.0 {
        let rate = format!("{:.2}%", options.error_rate * 100.0);
        info!(error_rate = %rate, "fault injection enabled");
        backend = Arc::new(FaultBackend::new(backend, options.error_rate));
    }

    if options.debug {
        backend = Arc::new(DebugBackend::new(backend));
    }

    Ok(backend)
}
