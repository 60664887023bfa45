//! Worker commands
//!
//! One [`WorkerCommand`] in, JSON Lines out. Discover and scan run the
//! orchestrator in-process with whatever privilege this process holds.

use anyhow::{Context, Result};
use lynx_common::{
    codec, DiscoveryMethod, MethodAvailability, OperationState, ScanMode, ScanRequest,
    WorkerCommand, WorkerReport,
};
use lynx_orchestrator::Orchestrator;
use lynx_privilege::{raw_socket_report, ProcessBroker};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{info, warn};

/// How the worker ended, as its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    InvalidRequest,
    Failed,
}

impl Outcome {
    pub const fn exit_code(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::InvalidRequest => 1,
            Outcome::Failed => 2,
        }
    }
}

/// First non-blank line of `input`, parsed as a command.
pub async fn read_command<R>(input: R) -> Result<WorkerCommand>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("reading request")? {
        if line.trim().is_empty() {
            continue;
        }
        return codec::decode_line(&line).context("invalid request");
    }
    anyhow::bail!("no request on stdin")
}

pub async fn execute<W, F>(command: WorkerCommand, out: &mut W, shutdown: F) -> Result<Outcome>
where
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    match command {
        WorkerCommand::Check => {
            let report = raw_socket_report();
            let reply = WorkerReport::Check {
                privileged: report.state.is_granted(),
                reason: report.reason,
            };
            codec::write_line(out, &reply).await?;
            Ok(Outcome::Success)
        }
        WorkerCommand::Methods => {
            codec::write_line(out, &availability(raw_socket_report().state.is_granted())).await?;
            Ok(Outcome::Success)
        }
        WorkerCommand::Discover(mut request) => {
            request.options.mode = ScanMode::Discover;
            run(request, out, shutdown).await
        }
        WorkerCommand::Scan(mut request) => {
            request.options.mode = ScanMode::Scan;
            run(request, out, shutdown).await
        }
    }
}

fn availability(privileged: bool) -> WorkerReport {
    let methods = DiscoveryMethod::ALL
        .iter()
        .map(|&method| MethodAvailability {
            method,
            requires_privilege: method.requires_privilege(),
            available: lynx_drivers::is_supported(method)
                && (privileged || !method.requires_privilege()),
        })
        .collect();
    WorkerReport::Methods { methods }
}

/// Stream every record of the operation to `out`. `shutdown` cancels it;
/// the terminal record is still written.
async fn run<W, F>(request: ScanRequest, out: &mut W, shutdown: F) -> Result<Outcome>
where
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    if let Err(e) = request.validate() {
        warn!(operation_id = %request.operation_id, error = %e, "request refused");
        return Ok(Outcome::InvalidRequest);
    }
    let orchestrator = Orchestrator::new(Arc::new(ProcessBroker));
    let mut handle = orchestrator.run_request(request)?;
    info!(operation_id = handle.operation_id(), "operation started");

    tokio::pin!(shutdown);
    let mut stopping = false;
    loop {
        tokio::select! {
            _ = &mut shutdown, if !stopping => {
                stopping = true;
                warn!("shutdown requested, cancelling");
                handle.cancel();
            }
            record = handle.next_record() => match record {
                Some(record) => codec::write_line(out, &record).await.context("writing stdout")?,
                None => break,
            },
        }
    }

    let summary = handle.finish().await?;
    info!(state = %summary.state, hosts = summary.hosts_found, "operation finished");
    Ok(match summary.state {
        OperationState::Failed => Outcome::Failed,
        _ => Outcome::Success,
    })
}
