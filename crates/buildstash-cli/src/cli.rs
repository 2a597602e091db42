use crate::logging::LogLevel;
use buildstash_backends::{BackendKind, BackendOptions};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "buildstash")]
#[command(
    about = "Remote build-cache agent speaking the toolchain's external-cache protocol over stdin/stdout"
)]
#[command(version)]
pub struct Cli {
    /// With no subcommand the agent serves the protocol until its input
    /// closes or the peer sends `close`.
    #[command(subcommand)]
    pub command: Option<Command>,

    #[arg(
        short = 'l',
        long,
        global = true,
        env = "BUILDSTASH_LOG",
        default_value = "warn",
        value_enum,
        help = "Logging level (logs go to stderr)"
    )]
    pub level: LogLevel,

    #[arg(long, global = true, help = "Output logs in JSON format")]
    pub json: bool,

    #[command(flatten)]
    pub agent: AgentArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Clear all entries from the backend and the local cache")]
    Clear,
}

/// Cache configuration shared by serving and `clear`. Every flag has an
/// environment fallback so the parent build process can configure the agent
/// without touching its argument list.
#[derive(clap::Args, Debug, Clone)]
pub struct AgentArgs {
    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_BACKEND",
        default_value = "local",
        value_enum,
        help = "Storage backend"
    )]
    pub backend: BackendArg,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_CACHE_DIR",
        help = "Local cache directory [default: <system tmp>/buildstash]"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_FS_LOCK",
        help = "Serialize same-key operations across sibling processes with advisory file locks"
    )]
    pub fs_lock: bool,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_LOCK_DIR",
        help = "Lock directory for --fs-lock [default: <system tmp>/buildstash-locks]"
    )]
    pub lock_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_S3_BUCKET",
        help = "S3 bucket name (required for the s3 backend)"
    )]
    pub s3_bucket: Option<String>,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_S3_PREFIX",
        default_value = "",
        help = "S3 key prefix"
    )]
    pub s3_prefix: String,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_RETRIES",
        default_value_t = 0,
        help = "Retries per failed request, with exponential backoff"
    )]
    pub retries: u32,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_ERROR_RATE",
        default_value_t = 0.0,
        help = "Inject backend errors at this rate (0.0-1.0, for testing)"
    )]
    pub error_rate: f64,

    #[arg(
        long,
        global = true,
        env = "BUILDSTASH_NO_STATS",
        help = "Skip the cache-statistics summary on shutdown"
    )]
    pub no_stats: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    /// No remote storage; the local cache serves all hits
    Local,
    /// S3-compatible object store
    S3,
}

impl AgentArgs {
    /// Local cache root, defaulting under the system temp directory.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("buildstash"))
    }

    /// Backend selection for the factory.
    #[must_use]
    pub fn backend_options(&self, debug: bool) -> BackendOptions {
        BackendOptions {
            kind: match self.backend {
                BackendArg::Local => BackendKind::Local,
                BackendArg::S3 => BackendKind::S3,
            },
            s3_bucket: self.s3_bucket.clone(),
            s3_prefix: self.s3_prefix.clone(),
            error_rate: self.error_rate,
            debug,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serve_the_local_backend() {
        let cli = Cli::try_parse_from(["buildstash"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.agent.backend, BackendArg::Local);
        assert_eq!(cli.agent.retries, 0);
        assert!(!cli.agent.fs_lock);
        assert!(!cli.agent.no_stats);
        assert!(matches!(cli.level, LogLevel::Warn));
    }

    #[test]
    fn clear_subcommand_shares_the_cache_flags() {
        let cli =
            Cli::try_parse_from(["buildstash", "clear", "--cache-dir", "/var/cache/bs"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Clear)));
        assert_eq!(cli.agent.cache_dir(), PathBuf::from("/var/cache/bs"));
    }

    #[test]
    fn s3_flags_parse() {
        let cli = Cli::try_parse_from([
            "buildstash",
            "--backend",
            "s3",
            "--s3-bucket",
            "artifacts",
            "--s3-prefix",
            "ci/",
            "--retries",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.agent.backend, BackendArg::S3);
        let options = cli.agent.backend_options(false);
        assert_eq!(options.s3_bucket.as_deref(), Some("artifacts"));
        assert_eq!(options.s3_prefix, "ci/");
        assert_eq!(cli.agent.retries, 2);
    }

    #[test]
    fn cache_dir_defaults_under_tmp() {
        let cli = Cli::try_parse_from(["buildstash"]).unwrap();
        assert!(cli.agent.cache_dir().ends_with("buildstash"));
    }
}
