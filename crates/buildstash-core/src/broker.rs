//! The request broker
//!
//! Owns the framing codec, dispatches every request through the
//! deduplication layers to the local cache or the backend, and writes the
//! response. One reader task pulls requests off stdin; each non-close
//! request runs in its own spawned task; responses funnel through the
//! serialized writer. `close` drains all in-flight tasks before the backend
//! is torn down, so it observes happens-before every earlier request.

use crate::backend::{Backend, Fetch};
use crate::codec::{RequestReader, ResponseWriter};
use crate::dedupe::{flight_key, FsLock, SingleFlight};
use crate::error::{Error, Result};
use crate::localcache::{EntryMeta, LocalCache};
use crate::protocol::{Cmd, Request, Response};
use crate::stats::BrokerStats;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Base delay for the retry wrapper's exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// Broker tunables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Retries per failed request (0 disables the retry wrapper).
    /// `close` is never retried.
    pub retry_attempts: u32,
    /// Emit the statistics summary on shutdown.
    pub print_stats: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 0,
            print_stats: true,
        }
    }
}

/// Shared result of a coalesced `get`.
#[derive(Debug, Clone)]
enum GetSummary {
    Miss,
    Hit {
        output_id: Vec<u8>,
        size: u64,
        stored_at: DateTime<Utc>,
        disk_path: PathBuf,
    },
}

/// The request broker.
pub struct Broker {
    backend: Arc<dyn Backend>,
    local: LocalCache,
    fs_lock: Option<FsLock>,
    config: BrokerConfig,
    stats: BrokerStats,
    get_flights: SingleFlight<GetSummary>,
    put_flights: SingleFlight<PathBuf>,
}

impl Broker {
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        local: LocalCache,
        fs_lock: Option<FsLock>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            backend,
            local,
            fs_lock,
            config,
            stats: BrokerStats::new(),
            get_flights: SingleFlight::new(),
            put_flights: SingleFlight::new(),
        }
    }

    /// Serve the protocol over the given streams until the peer closes its
    /// end or sends `close`.
    ///
    /// Per-request failures are reported to the peer and serving continues;
    /// framing errors and response-write errors are fatal: in-flight
    /// requests are drained, then the error propagates.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let broker = Arc::new(self);
        let writer = Arc::new(ResponseWriter::new(output));
        let mut reader = RequestReader::new(input);
        let mut tasks: JoinSet<()> = JoinSet::new();
        // Carries the first fatal write error out of the handler tasks.
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);

        writer.send_handshake().await?;

        loop {
            if let Ok(err) = err_rx.try_recv() {
                drain(&mut tasks).await;
                return Err(err);
            }

            let request = match reader.read().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) => {
                    drain(&mut tasks).await;
                    return Err(err);
                }
            };

            if request.command == Cmd::Close {
                debug!(id = request.id, "close received, draining in-flight requests");
                drain(&mut tasks).await;
                let response = match broker.dispatch(&request).await {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(error = %err, "backend close failed");
                        error_response(&request, &err)
                    }
                };
                writer.send(&response).await?;
                if broker.config.print_stats {
                    broker.stats.log_summary();
                }
                debug!("close handled, exiting");
                return Ok(());
            }

            let broker = Arc::clone(&broker);
            let writer = Arc::clone(&writer);
            let err_tx = err_tx.clone();
            tasks.spawn(async move {
                let response = broker.handle_with_retries(&request).await;
                if let Err(err) = writer.send(&response).await {
                    let _ = err_tx.try_send(err);
                }
            });
        }

        // EOF: orderly shutdown.
        drain(&mut tasks).await;
        if let Ok(err) = err_rx.try_recv() {
            return Err(err);
        }
        if broker.config.print_stats {
            broker.stats.log_summary();
        }
        Ok(())
    }

    /// Counters collected so far.
    #[must_use]
    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    /// Handle one request, retrying failures per the configured policy.
    async fn handle_with_retries(&self, request: &Request) -> Response {
        let max_retries = self.config.retry_attempts;
        let mut attempt: u32 = 0;
        loop {
            match self.dispatch(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        debug!(
                            command = %request.command,
                            action_id = %request.action_fingerprint(),
                            attempts = attempt + 1,
                            "request succeeded after retry"
                        );
                    }
                    return response;
                }
                Err(err) => {
                    if request.command == Cmd::Close || attempt >= max_retries {
                        if max_retries > 0 {
                            warn!(
                                command = %request.command,
                                action_id = %request.action_fingerprint(),
                                attempts = attempt + 1,
                                error = %err,
                                "request failed after all retries"
                            );
                        }
                        return error_response(request, &err);
                    }

                    self.stats.record_retry(attempt == 0);
                    let delay = RETRY_BASE_DELAY * (1 << attempt.min(16));
                    debug!(
                        command = %request.command,
                        action_id = %request.action_fingerprint(),
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn dispatch(&self, request: &Request) -> Result<Response> {
        match &request.command {
            Cmd::Put => self.handle_put(request).await,
            Cmd::Get => self.handle_get(request).await,
            Cmd::Close => {
                self.backend.close().await?;
                Ok(Response::for_request(request.id))
            }
            Cmd::Unknown(name) => Err(Error::unknown_command(name)),
        }
    }

    async fn handle_put(&self, request: &Request) -> Result<Response> {
        let action_id = request
            .action_id
            .clone()
            .ok_or_else(|| Error::protocol("put request is missing ActionID"))?;
        let fingerprint = hex::encode(&action_id);
        if self.stats.record_put(&fingerprint) {
            debug!(action_id = %fingerprint, "repeated put for action ID");
        }

        let output_id = request.output_id.clone().unwrap_or_default();
        let size = request.body_size.unwrap_or(0);
        let body = request.body.clone().unwrap_or_else(Bytes::new);
        let key = flight_key("put", &action_id);

        let backend = Arc::clone(&self.backend);
        let local = self.local.clone();
        let fs_lock = self.fs_lock.clone();
        let flight_id = key.clone();
        let (outcome, shared) = self
            .put_flights
            .run(&key, move || async move {
                let store = move || async move {
                    backend.put(&action_id, &output_id, body.clone(), size).await?;
                    let meta = EntryMeta {
                        output_id,
                        size,
                        stored_at: Utc::now(),
                    };
                    let mut reader = &body[..];
                    local.write_with_metadata(&action_id, &mut reader, &meta).await
                };
                match &fs_lock {
                    Some(lock) => lock.run(&flight_id, store).await,
                    None => store().await,
                }
            })
            .await;

        if shared {
            self.stats.record_shared_put();
            debug!(action_id = %fingerprint, "put coalesced into in-flight call");
        }

        let disk_path = outcome.map_err(Error::Shared)?;
        let mut response = Response::for_request(request.id);
        response.disk_path = Some(disk_path.display().to_string());
        Ok(response)
    }

    async fn handle_get(&self, request: &Request) -> Result<Response> {
        let action_id = request
            .action_id
            .clone()
            .ok_or_else(|| Error::protocol("get request is missing ActionID"))?;
        let fingerprint = hex::encode(&action_id);
        if self.stats.record_get(&fingerprint) {
            debug!(action_id = %fingerprint, "repeated get for action ID");
        }

        let key = flight_key("get", &action_id);
        let backend = Arc::clone(&self.backend);
        let local = self.local.clone();
        let fs_lock = self.fs_lock.clone();
        let flight_id = key.clone();
        let (outcome, shared) = self
            .get_flights
            .run(&key, move || async move {
                // Local fast path: a complete entry answers the lookup
                // without touching the backend.
                if let Some(meta) = local.check(&action_id).await {
                    return Ok(GetSummary::Hit {
                        disk_path: local.path(&action_id),
                        output_id: meta.output_id,
                        size: meta.size,
                        stored_at: meta.stored_at,
                    });
                }

                let fetch_and_materialize = move || async move {
                    match backend.get(&action_id).await? {
                        Fetch::Miss => Ok(GetSummary::Miss),
                        Fetch::Hit(hit) => {
                            let meta = EntryMeta {
                                output_id: hit.output_id.clone(),
                                size: hit.size,
                                stored_at: hit.stored_at,
                            };
                            let mut body = hit.body;
                            let disk_path = local
                                .write_with_metadata(&action_id, &mut body, &meta)
                                .await?;
                            Ok(GetSummary::Hit {
                                output_id: hit.output_id,
                                size: hit.size,
                                stored_at: hit.stored_at,
                                disk_path,
                            })
                        }
                    }
                };
                match &fs_lock {
                    Some(lock) => lock.run(&flight_id, fetch_and_materialize).await,
                    None => fetch_and_materialize().await,
                }
            })
            .await;

        if shared {
            self.stats.record_shared_get();
            debug!(action_id = %fingerprint, "get coalesced into in-flight call");
        }

        let mut response = Response::for_request(request.id);
        match outcome.map_err(Error::Shared)? {
            GetSummary::Miss => {
                response.miss = true;
            }
            GetSummary::Hit {
                output_id,
                size,
                stored_at,
                disk_path,
            } => {
                self.stats.record_hit();
                response.output_id = Some(output_id);
                response.size = Some(size);
                response.time = Some(stored_at);
                response.disk_path = Some(disk_path.display().to_string());
            }
        }
        Ok(response)
    }
}

/// Fold a handler error into the response the peer sees. Failed lookups and
/// stores also report a miss so the toolchain falls back to doing the work.
fn error_response(request: &Request, err: &Error) -> Response {
    let mut response = Response::for_request(request.id);
    response.err = Some(err.to_string());
    if matches!(request.command, Cmd::Put | Cmd::Get) {
        response.miss = true;
    }
    response
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "request handler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: Cmd) -> Request {
        Request {
            id: 11,
            command,
            action_id: Some(vec![0xaa]),
            output_id: None,
            body_size: None,
            body: None,
        }
    }

    #[test]
    fn error_response_marks_misses_for_cache_commands() {
        let err = Error::backend("remote unavailable");

        let put = error_response(&request(Cmd::Put), &err);
        assert_eq!(put.id, 11);
        assert_eq!(put.err.as_deref(), Some("remote unavailable"));
        assert!(put.miss);

        let get = error_response(&request(Cmd::Get), &err);
        assert!(get.miss);

        let close = error_response(&request(Cmd::Close), &err);
        assert!(!close.miss);
        assert!(close.err.is_some());
    }

    #[test]
    fn unknown_command_error_uses_the_wire_name() {
        let err = Error::unknown_command("evict");
        let resp = error_response(&request(Cmd::Unknown("evict".into())), &err);
        assert_eq!(resp.err.as_deref(), Some("unknown command: evict"));
        assert!(!resp.miss);
    }
}
