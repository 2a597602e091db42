//! buildstash — remote build-cache agent
//!
//! A parent build process launches one agent per build with the toolchain's
//! external-cache environment variable pointing at this binary. The agent
//! answers content-addressed `get`/`put` requests over its standard streams
//! and exits when the input closes or the peer sends `close`.

mod cli;
mod commands;
mod logging;

use crate::cli::Command;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = cli::parse();

    if let Err(err) = logging::init(cli.level, cli.json) {
        eprintln!("buildstash: failed to initialize logging: {err}");
        return EXIT_FAILURE;
    }

    let result = match cli.command {
        Some(Command::Clear) => commands::clear(&cli).await,
        None => commands::serve(&cli).await,
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            // Render through miette so diagnostic codes and help text show.
            eprintln!("{:?}", miette::Report::new(err));
            EXIT_FAILURE
        }
    }
}
