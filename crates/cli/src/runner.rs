// runner.rs
use anyhow::{Context, Result};
use lynx_common::{
    DiscoveryMethod, PrivilegeBroker, PrivilegedExecutor, ProgressRecord, ScanMode, ScanOptions,
    ScanRequest,
};
use lynx_ipc::{default_socket_path, DaemonBroker, IpcClient, IpcExecutor};
use lynx_orchestrator::Orchestrator;
use lynx_privilege::{platform_broker, sibling_binary, ProcessBroker, WORKER_BINARY};
use lynx_supervisor::{SubprocessExecutor, WorkerBinary};
use lynx_target_resolver::TargetResolver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::args::{HelperArgs, Mode, Preset, PrivilegeAction, Route, ScanArgs};
use crate::output::{print_host_line, print_methods, print_privilege, print_results};

pub async fn run_scan(args: ScanArgs) -> Result<()> {
    info!("Starting scan...");
    info!("Targets: {}", args.targets);

    let spec = TargetResolver::resolve(&args.targets, args.ports.as_deref()).await?;
    let methods = parse_methods(&args.methods)?;
    let options = scan_options(&args);
    info!("Addresses: {}", spec.address_count());
    info!(
        "Methods: {}",
        methods.iter().map(|m| m.label()).collect::<Vec<_>>().join(", ")
    );

    let route = resolve_route(args.route, &args.helper);
    info!("Privileged route: {:?}", route);
    let orchestrator = build_orchestrator(route, &args.helper)?;

    let request = ScanRequest::new(spec, methods).with_options(options);
    let mut handle = orchestrator.run_request(request)?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, cancelling scan");
                handle.cancel();
            }
            record = handle.next_record() => match record {
                Some(ProgressRecord::Host(host)) => print_host_line(&host),
                Some(ProgressRecord::Log(line)) => {
                    info!(method = ?line.method, "{}", line.message);
                }
                Some(ProgressRecord::Completed(_)) => {}
                None => break,
            },
        }
    }

    let summary = handle.finish().await?;
    print_results(&summary, &args.output_format)?;
    Ok(())
}

pub fn list_methods() {
    print_methods(&DiscoveryMethod::ALL);
}

pub async fn privilege(action: PrivilegeAction, helper: &HelperArgs) -> Result<()> {
    let broker = platform_broker(&worker_path(helper)?);
    if action == PrivilegeAction::Setup {
        info!("Requesting privilege setup through {}", broker.name());
        broker
            .request_setup()
            .await
            .context("privilege setup failed")?;
    }
    print_privilege(&broker.check_privilege().await);
    Ok(())
}

pub async fn ping(helper: &HelperArgs) -> Result<()> {
    let socket = socket_path(helper);
    let client = IpcClient::connect(&socket)
        .await?
        .with_ceiling(Duration::from_secs(5));
    let alive = client.ping().await?;
    let check = client.check_privileges().await?;
    println!("daemon: {}", if alive { "alive" } else { "not responding" });
    println!("socket: {}", socket.display());
    println!(
        "privileged: {}{}",
        check.is_privileged,
        check.reason.map(|r| format!(" ({r})")).unwrap_or_default()
    );
    Ok(())
}

/// Comma-separated method names, or "all".
fn parse_methods(methods: &str) -> Result<Vec<DiscoveryMethod>> {
    if methods.trim().eq_ignore_ascii_case("all") {
        return Ok(DiscoveryMethod::ALL.to_vec());
    }
    let mut parsed = Vec::new();
    for token in methods.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let method: DiscoveryMethod = token.parse()?;
        if !parsed.contains(&method) {
            parsed.push(method);
        }
    }
    if parsed.is_empty() {
        anyhow::bail!("No methods specified");
    }
    Ok(parsed)
}

fn scan_options(args: &ScanArgs) -> ScanOptions {
    let mut options = match args.preset {
        Preset::Fast => ScanOptions::fast(),
        Preset::Balanced => ScanOptions::default(),
        Preset::Accurate => ScanOptions::accurate(),
    };
    if let Some(timeout) = args.timeout {
        options = options.with_timeout(Duration::from_millis(timeout));
    }
    if let Some(global) = args.global_timeout {
        options = options.with_global_timeout(Duration::from_millis(global));
    }
    if let Some(concurrency) = args.concurrency {
        options = options.with_concurrency(concurrency.max(1));
    }
    options
        .with_rate_limit(args.rate_limit)
        .with_resolve_hostnames(args.resolve_names)
        .with_mode(match args.mode {
            Mode::Discover => ScanMode::Discover,
            Mode::Scan => ScanMode::Scan,
        })
}

fn socket_path(helper: &HelperArgs) -> PathBuf {
    helper.socket.clone().unwrap_or_else(default_socket_path)
}

fn worker_path(helper: &HelperArgs) -> Result<PathBuf> {
    match &helper.worker {
        Some(path) => Ok(path.clone()),
        None => sibling_binary(WORKER_BINARY).context("locating lynx-worker"),
    }
}

/// Auto picks the daemon when its socket exists, then an installed worker.
fn resolve_route(route: Route, helper: &HelperArgs) -> Route {
    if route != Route::Auto {
        return route;
    }
    if socket_path(helper).exists() {
        Route::Ipc
    } else if worker_path(helper).map(|p| p.exists()).unwrap_or(false) {
        Route::Subprocess
    } else {
        Route::Local
    }
}

fn build_orchestrator(route: Route, helper: &HelperArgs) -> Result<Orchestrator> {
    let orchestrator = match route {
        Route::Ipc => {
            let socket = socket_path(helper);
            let setup = platform_broker(&worker_path(helper)?);
            let broker: Arc<dyn PrivilegeBroker> = Arc::new(DaemonBroker::new(&socket, setup));
            let executor: Arc<dyn PrivilegedExecutor> = Arc::new(IpcExecutor::new(&socket));
            Orchestrator::new(broker).with_executor(executor)
        }
        Route::Subprocess => {
            let worker = worker_path(helper)?;
            let broker: Arc<dyn PrivilegeBroker> = Arc::new(platform_broker(&worker));
            let executor: Arc<dyn PrivilegedExecutor> =
                Arc::new(SubprocessExecutor::new(WorkerBinary::new(worker)));
            Orchestrator::new(broker).with_executor(executor)
        }
        Route::Local | Route::Auto => Orchestrator::new(Arc::new(ProcessBroker)),
    };
    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> ScanArgs {
        use clap::Parser;
        let mut argv = vec!["lynx", "scan", "-t", "127.0.0.1"];
        argv.extend_from_slice(extra);
        match crate::args::Cli::try_parse_from(argv).unwrap().command {
            crate::args::Commands::Scan(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_methods_all() {
        assert_eq!(parse_methods("all").unwrap(), DiscoveryMethod::ALL.to_vec());
        assert_eq!(parse_methods(" ALL ").unwrap().len(), 9);
    }

    #[test]
    fn test_parse_methods_list() {
        let methods = parse_methods("icmp, tcp_connect,icmp_echo").unwrap();
        assert_eq!(
            methods,
            vec![DiscoveryMethod::IcmpEcho, DiscoveryMethod::TcpConnect]
        );
    }

    #[test]
    fn test_parse_methods_invalid() {
        assert!(parse_methods("carrier-pigeon").is_err());
        assert!(parse_methods(",,").is_err());
    }

    #[test]
    fn test_presets_and_overrides() {
        let options = scan_options(&args(&["--preset", "fast"]));
        assert_eq!(options, ScanOptions::fast());

        let options = scan_options(&args(&[
            "--preset", "accurate", "--timeout", "250", "-c", "0", "-r", "50", "--mode", "scan",
            "--resolve-names",
        ]));
        assert_eq!(options.timeout_ms, 250);
        assert_eq!(options.global_timeout_ms, ScanOptions::accurate().global_timeout_ms);
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.rate_limit, Some(50));
        assert_eq!(options.mode, ScanMode::Scan);
        assert!(options.resolve_hostnames);
    }

    #[test]
    fn test_explicit_route_is_kept() {
        let helper = HelperArgs::default();
        assert_eq!(resolve_route(Route::Local, &helper), Route::Local);
        assert_eq!(resolve_route(Route::Ipc, &helper), Route::Ipc);
    }

    #[test]
    fn test_auto_route_without_helpers_is_local() {
        let helper = HelperArgs {
            socket: Some(PathBuf::from("/nonexistent/lynx.sock")),
            worker: Some(PathBuf::from("/nonexistent/lynx-worker")),
        };
        assert_eq!(resolve_route(Route::Auto, &helper), Route::Local);
    }

    #[tokio::test]
    async fn test_local_route_scans_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let orchestrator = build_orchestrator(Route::Local, &HelperArgs::default()).unwrap();
        let spec = TargetResolver::resolve("127.0.0.1", Some(&port.to_string()))
            .await
            .unwrap();
        let options = ScanOptions::fast().with_global_timeout(Duration::from_secs(5));
        let handle = orchestrator
            .run_scan(spec, vec![DiscoveryMethod::TcpConnect], options)
            .unwrap();
        let summary = handle.finish().await.unwrap();
        assert_eq!(summary.hosts_found, 1);
        drop(listener);
    }
}
