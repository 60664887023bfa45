mod args;
mod output;
mod runner;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use args::{Cli, Commands};
use runner::{list_methods, ping, privilege, run_scan};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Scan(args) => run_scan(args).await?,
        Commands::Methods => list_methods(),
        Commands::Privilege { action, helper } => privilege(action, &helper).await?,
        Commands::Ping { helper } => ping(&helper).await?,
    }

    Ok(())
}

/// Logs share stderr with streamed hosts; stdout is left for results.
fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
