//! Tracing setup for the agent
//!
//! Standard output belongs to the protocol, so every log line goes to
//! stderr. The default filter scopes to the buildstash crates at the level
//! chosen on the command line; `RUST_LOG` overrides it entirely.

use clap::ValueEnum;
use std::io;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log level options for the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Show all logs (trace level)
    Trace,
    /// Show debug and above
    Debug,
    /// Show info and above
    Info,
    /// Show warnings and above (default)
    Warn,
    /// Show errors only
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Whether per-operation debug instrumentation should be enabled.
    #[must_use]
    pub fn verbose(self) -> bool {
        matches!(self, LogLevel::Trace | LogLevel::Debug)
    }
}

/// Initialize the global tracing subscriber.
pub fn init(level: LogLevel, json: bool) -> miette::Result<()> {
    let level = level.as_str();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "buildstash={level},buildstash_cli={level},buildstash_core={level},buildstash_backends={level}"
            ))
        })
        .map_err(|e| miette::miette!("failed to build log filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_target(false),
            )
            .init();
    }
    Ok(())
}
