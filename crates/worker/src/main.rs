//! lynx-worker - runs discovery with raw-socket privilege
//!
//! Spawned by the app or by `lynx-daemon`. Reads one JSON request line from
//! stdin, writes JSON Lines to stdout, logs to stderr.
//!
//! Exit codes: 0 success, 1 unreadable or invalid request, 2 operation failed.

mod commands;

use clap::Parser;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use commands::{execute, read_command, Outcome};

#[derive(Parser)]
#[command(name = "lynx-worker")]
#[command(version)]
#[command(about = "Privileged discovery worker (JSON request on stdin, JSON Lines on stdout)", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Take the request from this argument instead of stdin
    #[arg(long)]
    request: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let command = match cli.request {
        Some(line) => read_command(BufReader::new(line.as_bytes())).await,
        None => read_command(BufReader::new(tokio::io::stdin())).await,
    };
    let command = match command {
        Ok(command) => command,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(Outcome::InvalidRequest.exit_code());
        }
    };

    let mut stdout = tokio::io::stdout();
    match execute(command, &mut stdout, shutdown_signal()).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(Outcome::Failed.exit_code())
        }
    }
}

/// Stdout carries results, so logs always go to stderr.
fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
