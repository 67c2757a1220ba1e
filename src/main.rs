use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use cli::{run_command, Cli};

/// Exit status for an internal consistency failure
const EXIT_INCONSISTENT: i32 = 70;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Run the command
    if let Err(e) = run_command(cli).await {
        eprintln!("Error: {:#}", e);
        if matches!(e.downcast_ref::<arpsentry::Error>(), Some(arpsentry::Error::Table(_))) {
            std::process::exit(EXIT_INCONSISTENT);
        }
        std::process::exit(1);
    }

    Ok(())
}
