//! Line-oriented framing over the agent's standard streams
//!
//! Requests arrive as one JSON object per `\n`-terminated line; for a `put`
//! with a non-zero `BodySize` the next non-empty line is a JSON string
//! literal holding the base64-encoded body. Responses leave as compact JSON,
//! one per line, serialized by a writer mutex so concurrent handler tasks
//! never interleave bytes.

use crate::error::{Error, Result};
use crate::protocol::{Cmd, Request, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::trace;

/// Reads framed requests from the peer.
///
/// The reader is single-threaded by design: the broker owns it and is the
/// only task pulling requests off the stream.
pub struct RequestReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            reader: BufReader::new(input),
            line: String::new(),
        }
    }

    /// Read the next non-empty line, or `None` on end of stream.
    async fn next_line(&mut self) -> Result<Option<&str>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .map_err(|e| Error::io_no_path(e, "read request line"))?;
            if n == 0 {
                return Ok(None);
            }
            if !self.line.trim().is_empty() {
                return Ok(Some(self.line.trim_end_matches('\n')));
            }
        }
    }

    /// Read the next request, attaching the decoded body for `put` requests
    /// with a non-zero `BodySize`. Returns `Ok(None)` on a clean end of
    /// stream; end of stream in the middle of a request is a framing error.
    pub async fn read(&mut self) -> Result<Option<Request>> {
        let Some(line) = self.next_line().await? else {
            return Ok(None);
        };
        let mut request: Request = serde_json::from_str(line).map_err(|e| {
            Error::protocol(format!("malformed request line {line:?}: {e}"))
        })?;
        trace!(id = request.id, command = %request.command, "request line read");

        let body_size = request.body_size.unwrap_or(0);
        if request.command == Cmd::Put && body_size > 0 {
            let Some(body_line) = self.next_line().await? else {
                return Err(Error::protocol(format!(
                    "end of stream while awaiting {body_size}-byte body for request {}",
                    request.id
                )));
            };
            let encoded: String = serde_json::from_str(body_line).map_err(|e| {
                Error::protocol(format!("body line is not a JSON string literal: {e}"))
            })?;
            let body = BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| Error::protocol(format!("malformed base64 body: {e}")))?;
            if body.len() as u64 != body_size {
                return Err(Error::protocol(format!(
                    "body length mismatch: header says {body_size} bytes, body line holds {}",
                    body.len()
                )));
            }
            request.body = Some(Bytes::from(body));
        }

        Ok(Some(request))
    }
}

/// Serialized response writer shared by concurrent handler tasks.
pub struct ResponseWriter<W> {
    inner: tokio::sync::Mutex<BufWriter<W>>,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(BufWriter::new(output)),
        }
    }

    /// Serialize one response as compact JSON and write it with its `\n`
    /// terminator under the writer lock.
    pub async fn send(&self, response: &Response) -> Result<()> {
        let mut data = serde_json::to_vec(response)
            .map_err(|e| Error::protocol(format!("failed to serialize response: {e}")))?;
        data.push(b'\n');

        let mut writer = self.inner.lock().await;
        writer
            .write_all(&data)
            .await
            .map_err(|e| Error::io_no_path(e, "write response"))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::io_no_path(e, "flush response"))?;
        Ok(())
    }

    /// Emit the initial capabilities response. Sent before any request is
    /// read so the peer knows which commands the agent supports.
    pub async fn send_handshake(&self) -> Result<()> {
        self.send(&Response::handshake()).await
    }
}
