//! The `clear` subcommand: wipe the backend and the local cache

use crate::cli::Cli;
use buildstash_backends::create_backend;
use buildstash_core::{LocalCache, Result};

/// Remove every entry from the configured backend and the local cache root.
pub async fn clear(cli: &Cli) -> Result<()> {
    let backend = create_backend(&cli.agent.backend_options(cli.level.verbose())).await?;
    backend.clear().await?;
    backend.close().await?;

    let local = LocalCache::new(cli.agent.cache_dir()).await?;
    local.clear().await?;

    println!("Cache cleared successfully");
    Ok(())
}
