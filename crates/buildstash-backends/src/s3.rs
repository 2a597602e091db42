//! S3-compatible object-store backend
//!
//! Entries live at `<prefix><hex-action-id>`; the output ID, body size, and
//! store time travel as S3 object metadata so a lookup needs a single
//! `GetObject`. The body streams straight out of the response into the
//! broker's local cache.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use buildstash_core::{Backend, Error, Fetch, FetchHit, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Maximum objects per `DeleteObjects` request.
const DELETE_BATCH: usize = 1000;

/// Object-store backend over the AWS S3 API.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    /// Connect using ambient AWS configuration (environment, profile,
    /// instance metadata) and verify the bucket is reachable.
    pub async fn connect(bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let backend = Self::with_client(Client::new(&config), bucket, prefix);

        backend
            .client
            .head_bucket()
            .bucket(&backend.bucket)
            .send()
            .await
            .map_err(|e| {
                Error::backend(format!(
                    "failed to access S3 bucket {}: {e}",
                    backend.bucket
                ))
            })?;

        debug!(bucket = %backend.bucket, prefix = %backend.prefix, "connected to S3 bucket");
        Ok(backend)
    }

    /// Build a backend around an existing client. Does not probe the bucket.
    #[must_use]
    pub fn with_client(
        client: Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn object_key(&self, action_id: &[u8]) -> String {
        format!("{}{}", self.prefix, hex::encode(action_id))
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn put(
        &self,
        action_id: &[u8],
        output_id: &[u8],
        body: Bytes,
        size: u64,
    ) -> Result<()> {
        let key = self.object_key(action_id);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .metadata("outputid", hex::encode(output_id))
            .metadata("size", size.to_string())
            .metadata("time", Utc::now().timestamp().to_string())
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::backend(format!("failed to upload {key} to S3: {e}")))?;
        Ok(())
    }

    async fn get(&self, action_id: &[u8]) -> Result<Fetch> {
        let key = self.object_key(action_id);
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    return Ok(Fetch::Miss);
                }
                return Err(Error::backend(format!(
                    "failed to fetch {key} from S3: {e}"
                )));
            }
        };

        // Objects without usable metadata were not written by this agent;
        // treat them as absent rather than failing the build.
        let metadata = object.metadata().cloned().unwrap_or_default();
        let parsed = metadata.get("outputid").and_then(|v| hex::decode(v).ok()).and_then(
            |output_id| {
                let size: u64 = metadata.get("size")?.parse().ok()?;
                let secs: i64 = metadata.get("time")?.parse().ok()?;
                let stored_at = DateTime::<Utc>::from_timestamp(secs, 0)?;
                Some((output_id, size, stored_at))
            },
        );
        let Some((output_id, size, stored_at)) = parsed else {
            warn!(key = %key, "S3 object has missing or invalid cache metadata");
            return Ok(Fetch::Miss);
        };

        Ok(Fetch::Hit(FetchHit {
            output_id,
            size,
            stored_at,
            body: Box::new(object.body.into_async_read()),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();

        let mut keys: Vec<String> = Vec::new();
        while let Some(page) = pages.next().await {
            let page =
                page.map_err(|e| Error::backend(format!("failed to list S3 objects: {e}")))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }

        for chunk in keys.chunks(DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::backend(format!("failed to build delete request: {e}")))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| Error::backend(format!("failed to build delete request: {e}")))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| Error::backend(format!("failed to delete S3 objects: {e}")))?;
        }

        debug!(count = keys.len(), "cleared S3 cache entries");
        Ok(())
    }
}
