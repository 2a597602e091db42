//! Wire protocol types for the toolchain's external-cache protocol
//!
//! The peer sends one JSON request object per line; the agent answers with
//! one JSON response object per line. Field names and base64 byte encoding
//! match the toolchain's own serializer, so they are spelled out with serde
//! renames rather than derived from the Rust names.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A cache command.
///
/// Unrecognized command strings deserialize into [`Cmd::Unknown`] so the
/// broker can answer them with a per-request error instead of tearing down
/// the whole stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cmd {
    /// Store an artifact body under an action ID
    Put,
    /// Look up an artifact by action ID
    Get,
    /// Drain in-flight requests and shut down
    Close,
    /// Any command the agent does not implement
    Unknown(String),
}

impl Cmd {
    /// Wire spelling of the command
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Cmd::Put => "put",
            Cmd::Get => "get",
            Cmd::Close => "close",
            Cmd::Unknown(name) => name,
        }
    }

    /// The command set advertised in the handshake response
    #[must_use]
    pub fn known() -> Vec<Cmd> {
        vec![Cmd::Put, Cmd::Get, Cmd::Close]
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Cmd {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Cmd {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(match name.as_str() {
            "put" => Cmd::Put,
            "get" => Cmd::Get,
            "close" => Cmd::Close,
            _ => Cmd::Unknown(name),
        })
    }
}

/// Base64 (standard alphabet, padded) codec for optional byte fields.
///
/// The toolchain marshals raw byte slices as base64 strings; decoding is
/// strict so non-canonical input is rejected at the framing layer.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// A request from the peer toolchain.
///
/// Lives for one broker transaction. For `put` requests with a non-zero
/// `BodySize`, the framing codec attaches the decoded body bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Peer-chosen request identifier, echoed back in the response
    #[serde(rename = "ID")]
    pub id: i64,

    /// Command to execute
    #[serde(rename = "Command")]
    pub command: Cmd,

    /// Content-addressed lookup key (opaque bytes)
    #[serde(rename = "ActionID", default, with = "base64_bytes")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<Vec<u8>>,

    /// Opaque bytes stored with the body, echoed back on hits
    #[serde(rename = "OutputID", default, with = "base64_bytes")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_id: Option<Vec<u8>>,

    /// Body length in bytes for `put` requests
    #[serde(rename = "BodySize", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<u64>,

    /// Decoded body bytes, attached by the framing codec
    #[serde(skip)]
    pub body: Option<Bytes>,
}

impl Request {
    /// Hex fingerprint of the action ID, used for filenames, dedup keys,
    /// and log output
    #[must_use]
    pub fn action_fingerprint(&self) -> String {
        hex::encode(self.action_id.as_deref().unwrap_or_default())
    }
}

/// A response to the peer toolchain.
///
/// Emitted exactly once per request; additionally, one handshake response
/// with `ID` 0 and the known-command list is emitted before any request is
/// read. Empty optional fields are omitted from the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Identifier of the request this answers (0 for the handshake)
    #[serde(rename = "ID")]
    pub id: i64,

    /// Error message when the request failed
    #[serde(rename = "Err", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    /// Supported commands, sent only in the handshake response
    #[serde(rename = "KnownCommands", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_commands: Option<Vec<Cmd>>,

    /// True when a lookup found no entry
    #[serde(rename = "Miss", default)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub miss: bool,

    /// Output ID recorded with the entry, present on hits
    #[serde(rename = "OutputID", default, with = "base64_bytes")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_id: Option<Vec<u8>>,

    /// Body length in bytes, present on hits
    #[serde(rename = "Size", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Store time of the entry, present on hits
    #[serde(rename = "Time", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Absolute path of the materialized body on disk
    #[serde(rename = "DiskPath", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
}

impl Response {
    /// Start a response for the given request ID
    #[must_use]
    pub fn for_request(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// The handshake response advertising the supported command set
    #[must_use]
    pub fn handshake() -> Self {
        Self {
            id: 0,
            known_commands: Some(Cmd::known()),
            ..Self::default()
        }
    }
}
