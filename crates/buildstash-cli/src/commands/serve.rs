//! The default mode: serve the cache protocol over stdin/stdout

use crate::cli::Cli;
use buildstash_backends::create_backend;
use buildstash_core::dedupe::FsLock;
use buildstash_core::{Broker, BrokerConfig, LocalCache, Result};
use tracing::debug;

/// Run the agent until its input closes or the peer sends `close`.
pub async fn serve(cli: &Cli) -> Result<()> {
    let cache_dir = cli.agent.cache_dir();
    let local = LocalCache::new(&cache_dir).await?;
    debug!(cache_dir = %cache_dir.display(), "local cache ready");

    let backend = create_backend(&cli.agent.backend_options(cli.level.verbose())).await?;

    let fs_lock = if cli.agent.fs_lock {
        let lock = FsLock::new(cli.agent.lock_dir.clone()).await?;
        debug!("cross-process locking enabled");
        Some(lock)
    } else {
        None
    };

    let config = BrokerConfig {
        retry_attempts: cli.agent.retries,
        print_stats: !cli.agent.no_stats,
    };

    Broker::new(backend, local, fs_lock, config)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
}
