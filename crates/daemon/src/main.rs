//! lynx-daemon - the privileged helper
//!
//! Listens on the helper socket, authenticates each caller, and runs every
//! discover or scan call in a fresh `lynx-worker` process.

use anyhow::{Context, Result};
use clap::Parser;
use lynx_ipc::{
    default_socket_path, CallerVerifier, ExecutableVerifier, IpcServer, PeerCredentials,
    UidVerifier,
};
use lynx_privilege::{sibling_binary, WORKER_BINARY};
use lynx_supervisor::WorkerBinary;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "lynx-daemon")]
#[command(version)]
#[command(about = "Privileged network discovery helper", long_about = None)]
struct Cli {
    /// Socket path
    #[arg(long, env = "LYNX_HELPER_SOCKET")]
    socket: Option<PathBuf>,

    /// Worker binary (defaults to lynx-worker beside this executable)
    #[arg(long, env = "LYNX_WORKER")]
    worker: Option<PathBuf>,

    /// Also accept callers with these user IDs, wherever they are installed
    #[arg(long = "allow-uid", value_delimiter = ',')]
    allow_uids: Vec<u32>,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let socket = cli.socket.unwrap_or_else(default_socket_path);
    let worker = match cli.worker {
        Some(path) => path,
        None => sibling_binary(WORKER_BINARY).context("locating lynx-worker")?,
    };
    info!(socket = %socket.display(), worker = %worker.display(), "starting lynx-daemon");

    let mut server = IpcServer::bind(&socket, WorkerBinary::new(worker))
        .with_context(|| format!("binding {}", socket.display()))?;
    if !cli.allow_uids.is_empty() {
        let installed = ExecutableVerifier::beside_current_exe()?;
        let uids = UidVerifier::new(cli.allow_uids);
        server = server.with_verifier(move |peer: &PeerCredentials| {
            installed.verify_caller(peer) || uids.verify_caller(peer)
        });
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        trigger.cancel();
    });

    server.run(shutdown).await.context("serving socket")?;
    Ok(())
}

fn init_logging(verbose: u8, json: bool) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).compact().init();
    }
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
