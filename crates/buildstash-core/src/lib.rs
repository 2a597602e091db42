//! Core of the buildstash remote-cache agent
//!
//! This crate implements the agent's request broker and everything it owns:
//! - Line-oriented JSON framing over stdin/stdout ([`codec`])
//! - The wire protocol types ([`protocol`])
//! - The content-addressed local cache the toolchain reads artifacts from
//!   ([`localcache`])
//! - The storage-backend contract ([`backend`])
//! - Two-level request deduplication: in-process single-flight and
//!   cross-process advisory file locks ([`dedupe`])
//! - The concurrent broker loop tying it all together ([`broker`])
//!
//! # Overview
//!
//! A parent build process launches one agent per build and speaks the
//! toolchain's external-cache protocol over the agent's standard streams.
//! The broker answers `get` lookups and `put` stores, collapsing duplicate
//! work per action ID both inside the process (single-flight) and across
//! sibling processes sharing a cache root (advisory locks), and materializes
//! artifact bodies on disk so the toolchain can read them by absolute path.

pub mod backend;
pub mod broker;
pub mod codec;
pub mod dedupe;
mod error;
pub mod localcache;
pub mod protocol;
pub mod stats;

pub use backend::{Backend, BodyStream, Fetch, FetchHit};
pub use broker::{Broker, BrokerConfig};
pub use error::{Error, Result};
pub use localcache::{EntryMeta, LocalCache};
pub use protocol::{Cmd, Request, Response};
