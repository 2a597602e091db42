//! Cross-process mutual exclusion via advisory filesystem locks
//!
//! Sibling agent processes sharing a cache root coordinate through lock
//! files in a shared directory. Keys are hashed to bound filename length
//! and character set. Lock files are never deleted: removing one would race
//! with a peer that already holds an open handle to it.

use crate::error::{Error, Result};
use fs4::tokio::AsyncFileExt;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Total wait ceiling for one acquisition.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
/// Interval between acquisition probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Advisory-lock group rooted at a shared lock directory.
///
/// Provides mutual exclusion only: every caller that acquires the lock runs
/// the operation itself, typically a backend call that will observe the
/// prior holder's side effects.
#[derive(Debug, Clone)]
pub struct FsLock {
    lock_dir: PathBuf,
}

impl FsLock {
    /// Open (creating if absent) a lock group in `lock_dir`, defaulting to
    /// a deterministic subdirectory of the system temp area so unrelated
    /// agent processes agree on it.
    pub async fn new(lock_dir: Option<PathBuf>) -> Result<Self> {
        let lock_dir =
            lock_dir.unwrap_or_else(|| std::env::temp_dir().join("buildstash-locks"));
        tokio::fs::create_dir_all(&lock_dir)
            .await
            .map_err(|e| Error::io(e, &lock_dir, "create_dir_all"))?;
        Ok(Self { lock_dir })
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.lock_dir.join(format!("{}.lock", hex::encode(digest)))
    }

    /// Run `f` while holding the exclusive advisory lock for `key`.
    ///
    /// Acquisition probes every ~10 ms with a ~1 s ceiling; hitting the
    /// ceiling fails the current request only. The lock is released on all
    /// exit paths: explicitly on completion, and by the file handle closing
    /// if the future is dropped mid-call.
    pub async fn run<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::io(e, &path, "open lock file"))?;

        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            match file.try_lock_exclusive() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => return Err(Error::lock(e.to_string())),
            }
            if Instant::now() >= deadline {
                debug!(key, lock = %path.display(), "lock acquisition timed out");
                return Err(Error::LockTimeout);
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        let result = f().await;

        if let Err(e) = file.unlock() {
            // The OS drops the lock with the handle anyway.
            warn!(key, error = %e, "failed to release advisory lock");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    async fn lock_group(tmp: &TempDir) -> FsLock {
        FsLock::new(Some(tmp.path().to_path_buf())).await.unwrap()
    }

    #[tokio::test]
    async fn runs_the_operation_and_returns_its_result() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_group(&tmp).await;
        let value = lock.run("key", || async { Ok(5u32) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn lock_files_are_hashed_and_kept() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_group(&tmp).await;
        lock.run("some key", || async { Ok(()) }).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        // 64 hex chars + ".lock"
        assert_eq!(names[0].len(), 69);
        assert!(names[0].ends_with(".lock"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_executions_are_mutually_exclusive() {
        let tmp = TempDir::new().unwrap();
        let lock = Arc::new(lock_group(&tmp).await);
        let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let events = events.clone();
            handles.push(tokio::spawn(async move {
                lock.run("shared", || async move {
                    events.lock().unwrap().push("enter");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    events.lock().unwrap().push("exit");
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // With the lock held across each body, entries and exits strictly
        // alternate.
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 8);
        for pair in events.chunks(2) {
            assert_eq!(pair, ["enter", "exit"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquisition_times_out_when_the_lock_is_held() {
        let tmp = TempDir::new().unwrap();
        let lock = Arc::new(lock_group(&tmp).await);

        let holder = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.run("contested", || async {
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                    Ok(())
                })
                .await
            })
        };

        // Let the holder acquire first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = lock
            .run("contested", || async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to acquire lock: timeout");

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let tmp = TempDir::new().unwrap();
        let lock = Arc::new(lock_group(&tmp).await);

        let slow = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.run("a", || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        lock.run("b", || async { Ok(()) }).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        slow.await.unwrap().unwrap();
    }
}
