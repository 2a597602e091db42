//! Content-addressed local cache the toolchain reads artifacts from
//!
//! For an action ID with hex fingerprint `h`, the body lives at `ROOT/h`
//! and a small textual sidecar at `ROOT/h.meta`. Writes are atomic: bodies
//! stream into a unique `ROOT/.tmp-*` file that is renamed into place, and
//! sidecars are written via `ROOT/h.meta.tmp` the same way. An entry is
//! complete only when both files exist and the sidecar parses; callers must
//! treat a body without a usable sidecar as missing.
//!
//! The broker serializes mutations per action ID, so this type needs no
//! per-key locking of its own; operations on distinct action IDs touch
//! disjoint paths and may run in parallel.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncRead;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sidecar metadata for a cached entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Opaque bytes recorded with the body, echoed back on hits
    pub output_id: Vec<u8>,
    /// Body length in bytes
    pub size: u64,
    /// When the entry was stored
    pub stored_at: DateTime<Utc>,
}

/// The on-disk cache of materialized artifact bodies.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    /// Open (creating if absent) a cache rooted at `root`.
    ///
    /// The root is canonicalized so every path handed back to the toolchain
    /// is absolute.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        let root = fs::canonicalize(&root)
            .await
            .map_err(|e| Error::io(e, &root, "canonicalize"))?;
        Ok(Self { root })
    }

    /// Absolute path a body for `action_id` would live at. Pure computation;
    /// does not touch the filesystem.
    #[must_use]
    pub fn path(&self, action_id: &[u8]) -> PathBuf {
        self.root.join(hex::encode(action_id))
    }

    fn meta_path(&self, action_id: &[u8]) -> PathBuf {
        self.root.join(format!("{}.meta", hex::encode(action_id)))
    }

    /// Stream `body` into the cache atomically and return the absolute path
    /// of the materialized file.
    pub async fn write(
        &self,
        action_id: &[u8],
        body: &mut (impl AsyncRead + Unpin + ?Sized),
    ) -> Result<PathBuf> {
        let final_path = self.path(action_id);
        let tmp_path = self.root.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = self.fill_temp_file(&tmp_path, body).await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::io(e, &final_path, "rename"));
        }

        Ok(final_path)
    }

    async fn fill_temp_file(
        &self,
        tmp_path: &Path,
        body: &mut (impl AsyncRead + Unpin + ?Sized),
    ) -> Result<()> {
        let mut file = fs::File::create(tmp_path)
            .await
            .map_err(|e| Error::io(e, tmp_path, "create"))?;
        tokio::io::copy(body, &mut file)
            .await
            .map_err(|e| Error::io(e, tmp_path, "write"))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io(e, tmp_path, "sync"))?;
        Ok(())
    }

    /// Write the sidecar for `action_id`, replacing any previous one.
    pub async fn write_metadata(&self, action_id: &[u8], meta: &EntryMeta) -> Result<()> {
        let meta_path = self.meta_path(action_id);
        let tmp_path = self.root.join(format!(
            "{}.meta.tmp",
            hex::encode(action_id)
        ));

        let content = format!(
            "outputID:{}\nsize:{}\ntime:{}\n",
            hex::encode(&meta.output_id),
            meta.size,
            meta.stored_at.timestamp()
        );

        fs::write(&tmp_path, content)
            .await
            .map_err(|e| Error::io(e, &tmp_path, "write"))?;
        if let Err(e) = fs::rename(&tmp_path, &meta_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::io(e, &meta_path, "rename"));
        }
        Ok(())
    }

    /// Write body and sidecar. A sidecar failure after a successful body
    /// write is soft: the path is still returned, but the entry will read
    /// as missing until a later store replaces the sidecar.
    pub async fn write_with_metadata(
        &self,
        action_id: &[u8],
        body: &mut (impl AsyncRead + Unpin + ?Sized),
        meta: &EntryMeta,
    ) -> Result<PathBuf> {
        let disk_path = self.write(action_id, body).await?;
        if let Err(err) = self.write_metadata(action_id, meta).await {
            warn!(
                action_id = %hex::encode(action_id),
                error = %err,
                "failed to write cache entry sidecar"
            );
        }
        Ok(disk_path)
    }

    /// Return the entry's metadata if it is complete: body present, sidecar
    /// present and parseable. A body without a usable sidecar logs a warning
    /// and reads as missing.
    pub async fn check(&self, action_id: &[u8]) -> Option<EntryMeta> {
        let disk_path = self.path(action_id);
        if fs::metadata(&disk_path).await.is_err() {
            return None;
        }

        let meta_path = self.meta_path(action_id);
        let raw = match fs::read_to_string(&meta_path).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    action_id = %hex::encode(action_id),
                    error = %err,
                    "cache body exists but sidecar is unreadable"
                );
                return None;
            }
        };

        match parse_sidecar(&raw) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(
                    action_id = %hex::encode(action_id),
                    error = %err,
                    "cache body exists but sidecar is corrupt"
                );
                None
            }
        }
    }

    /// Remove the cache root and recreate it empty. Safe to call when the
    /// root does not exist.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(e, &self.root, "remove_dir_all")),
        }
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::io(e, &self.root, "create_dir_all"))?;
        debug!(root = %self.root.display(), "local cache cleared");
        Ok(())
    }
}

/// Parse the sidecar text format.
///
/// Lines are trimmed before prefix matching; unknown and blank lines are
/// ignored so the format can grow fields. A sidecar missing `outputID` is
/// corrupt. Missing `size`/`time` lines default to 0, but present lines
/// that do not parse as numbers are corrupt.
fn parse_sidecar(raw: &str) -> Result<EntryMeta> {
    let mut output_id_hex: Option<&str> = None;
    let mut size: u64 = 0;
    let mut time_secs: i64 = 0;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("outputID:") {
            output_id_hex = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("size:") {
            size = rest
                .trim()
                .parse()
                .map_err(|e| Error::metadata(format!("invalid size field: {e}")))?;
        } else if let Some(rest) = line.strip_prefix("time:") {
            time_secs = rest
                .trim()
                .parse()
                .map_err(|e| Error::metadata(format!("invalid time field: {e}")))?;
        }
    }

    let output_id_hex =
        output_id_hex.ok_or_else(|| Error::metadata("sidecar missing outputID field"))?;
    let output_id = hex::decode(output_id_hex)
        .map_err(|e| Error::metadata(format!("invalid outputID field: {e}")))?;
    let stored_at = DateTime::<Utc>::from_timestamp(time_secs, 0)
        .ok_or_else(|| Error::metadata("time field out of range"))?;

    Ok(EntryMeta {
        output_id,
        size,
        stored_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn cache() -> (TempDir, LocalCache) {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::new(tmp.path()).await.unwrap();
        (tmp, cache)
    }

    fn meta(output_id: &[u8], size: u64) -> EntryMeta {
        EntryMeta {
            output_id: output_id.to_vec(),
            size,
            stored_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn write_then_check_round_trips() {
        let (_tmp, cache) = cache().await;
        let action_id = [0xab, 0xcd];

        let path = cache
            .write_with_metadata(&action_id, &mut &b"hello"[..], &meta(b"out", 5))
            .await
            .unwrap();

        assert!(path.is_absolute());
        assert_eq!(path, cache.path(&action_id));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let found = cache.check(&action_id).await.unwrap();
        assert_eq!(found, meta(b"out", 5));
    }

    #[tokio::test]
    async fn zero_length_bodies_are_valid() {
        let (_tmp, cache) = cache().await;
        let action_id = [0x01];

        let path = cache
            .write_with_metadata(&action_id, &mut &b""[..], &meta(b"o", 0))
            .await
            .unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(cache.check(&action_id).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn check_returns_none_without_body() {
        let (_tmp, cache) = cache().await;
        assert!(cache.check(&[0x99]).await.is_none());
    }

    #[tokio::test]
    async fn body_without_sidecar_reads_as_missing() {
        let (_tmp, cache) = cache().await;
        let action_id = [0x02];
        cache.write(&action_id, &mut &b"data"[..]).await.unwrap();
        assert!(cache.check(&action_id).await.is_none());
    }

    #[tokio::test]
    async fn sidecar_missing_output_id_is_corrupt() {
        let (_tmp, cache) = cache().await;
        let action_id = [0x03];
        cache.write(&action_id, &mut &b"data"[..]).await.unwrap();
        std::fs::write(
            cache.path(&action_id).with_extension("meta"),
            "size:4\ntime:1700000000\n",
        )
        .unwrap();
        assert!(cache.check(&action_id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_and_blank_sidecar_lines_are_ignored() {
        let parsed = parse_sidecar(
            "\n  outputID:6f7574  \ncompression:none\n\nsize: 3 \ntime:1700000000\n",
        )
        .unwrap();
        assert_eq!(parsed.output_id, b"out");
        assert_eq!(parsed.size, 3);
    }

    #[tokio::test]
    async fn missing_size_and_time_default_to_zero() {
        let parsed = parse_sidecar("outputID:6f7574\n").unwrap();
        assert_eq!(parsed.size, 0);
        assert_eq!(parsed.stored_at.timestamp(), 0);
    }

    #[tokio::test]
    async fn garbled_numeric_fields_are_corrupt() {
        assert!(parse_sidecar("outputID:6f7574\nsize:many\n").is_err());
        assert!(parse_sidecar("outputID:6f7574\ntime:yesterday\n").is_err());
        assert!(parse_sidecar("outputID:zz\n").is_err());
    }

    #[tokio::test]
    async fn restore_overwrites_previous_entry() {
        let (_tmp, cache) = cache().await;
        let action_id = [0x04];

        cache
            .write_with_metadata(&action_id, &mut &b"first"[..], &meta(b"a", 5))
            .await
            .unwrap();
        cache
            .write_with_metadata(&action_id, &mut &b"second!"[..], &meta(b"b", 7))
            .await
            .unwrap();

        assert_eq!(std::fs::read(cache.path(&action_id)).unwrap(), b"second!");
        let found = cache.check(&action_id).await.unwrap();
        assert_eq!(found.output_id, b"b");
        assert_eq!(found.size, 7);
    }

    #[tokio::test]
    async fn no_temp_files_survive_writes() {
        let (tmp, cache) = cache().await;
        for i in 0u8..4 {
            cache
                .write_with_metadata(&[i], &mut &b"body"[..], &meta(b"o", 4))
                .await
                .unwrap();
        }
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with(".tmp-") || name.ends_with(".meta.tmp")
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let (tmp, cache) = cache().await;
        cache
            .write_with_metadata(&[0x05], &mut &b"x"[..], &meta(b"o", 1))
            .await
            .unwrap();

        cache.clear().await.unwrap();
        assert!(cache.check(&[0x05]).await.is_none());
        assert!(tmp.path().exists());

        // Clearing an already-empty cache, and one whose root vanished,
        // both succeed.
        cache.clear().await.unwrap();
        std::fs::remove_dir_all(tmp.path()).unwrap();
        cache.clear().await.unwrap();
    }
}
