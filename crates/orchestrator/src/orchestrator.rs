//! Orchestrator - operation scheduling and result merging

use crate::handle::ScanHandle;
use crate::host_table::HostTable;
use crate::hostnames::{self, DnsLookup, NameLookup};
use crate::progress::ScanTally;
use crate::registry::OperationRegistry;
use anyhow::{bail, Result};
use lynx_common::{
    Completion, DiscoveryMethod, DriverResult, DriverSummary, HostRecord, LogLine,
    OperationState, PrivilegeBroker, PrivilegedExecutor, ProgressRecord, ScanOptions,
    ScanRequest, ScanSummary, TargetSpecification, host_limit,
};
use lynx_drivers::{DriverEvent, EventSink, ProbeContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How long drivers get to wind down after cancellation before they are aborted.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Runs scan operations: privilege gating, driver fan-out, merge, lifecycle.
pub struct Orchestrator {
    broker: Arc<dyn PrivilegeBroker>,
    executor: Option<Arc<dyn PrivilegedExecutor>>,
    registry: OperationRegistry,
    grace: Duration,
    host_limit: u128,
    names: Option<Arc<dyn NameLookup>>,
}

impl Orchestrator {
    /// Orchestrator that runs privileged methods in-process when granted.
    pub fn new(broker: Arc<dyn PrivilegeBroker>) -> Self {
        Self {
            broker,
            executor: None,
            registry: OperationRegistry::new(),
            grace: DEFAULT_GRACE,
            host_limit: host_limit(),
            names: None,
        }
    }

    /// Route privileged methods through `executor` (daemon or worker subprocess).
    #[inline]
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn PrivilegedExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Largest target space a request may cover.
    #[inline]
    #[must_use]
    pub fn with_host_limit(mut self, limit: u128) -> Self {
        self.host_limit = limit;
        self
    }

    /// Resolver for `resolve_hostnames`; the system DNS configuration otherwise.
    #[inline]
    #[must_use]
    pub fn with_name_lookup(mut self, lookup: Arc<dyn NameLookup>) -> Self {
        self.names = Some(lookup);
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Cancel a live operation by ID. False if unknown or already finished.
    pub fn cancel(&self, operation_id: &str) -> bool {
        self.registry.cancel(operation_id)
    }

    /// Start an operation with a generated ID.
    pub fn run_scan(
        &self,
        spec: TargetSpecification,
        methods: Vec<DiscoveryMethod>,
        options: ScanOptions,
    ) -> Result<ScanHandle> {
        self.run_request(ScanRequest::new(spec, methods).with_options(options))
    }

    /// Start an operation under the caller's operation ID.
    #[instrument(skip(self, request), fields(operation_id = %request.operation_id))]
    pub fn run_request(&self, request: ScanRequest) -> Result<ScanHandle> {
        request.validate_with_limit(self.host_limit)?;
        let cancel = CancellationToken::new();
        if !self.registry.register(&request.operation_id, cancel.clone()) {
            bail!("operation {} is already running", request.operation_id);
        }

        let operation_id = request.operation_id.clone();
        let (out, records) = mpsc::unbounded_channel();
        let run = OperationRun {
            request,
            broker: self.broker.clone(),
            executor: self.executor.clone(),
            registry: self.registry.clone(),
            grace: self.grace,
            names: self.names.clone(),
            cancel,
            out,
        };
        let task = tokio::spawn(run.execute());

        Ok(ScanHandle::new(
            operation_id,
            records,
            self.registry.clone(),
            task,
        ))
    }
}

enum TaskOutcome {
    Driver(DiscoveryMethod, DriverResult<DriverSummary>),
    Remote(Vec<DiscoveryMethod>, Result<Completion>),
}

/// State of one operation, owned by its task.
struct OperationRun {
    request: ScanRequest,
    broker: Arc<dyn PrivilegeBroker>,
    executor: Option<Arc<dyn PrivilegedExecutor>>,
    registry: OperationRegistry,
    grace: Duration,
    names: Option<Arc<dyn NameLookup>>,
    cancel: CancellationToken,
    out: mpsc::UnboundedSender<ProgressRecord>,
}

impl OperationRun {
    async fn execute(self) -> ScanSummary {
        let started = std::time::Instant::now();
        let operation_id = self.request.operation_id.clone();
        self.registry
            .set_state(&operation_id, OperationState::Running);

        let mut methods = self.request.methods.clone();
        methods.sort();
        methods.dedup();
        let (privileged, unprivileged): (Vec<_>, Vec<_>) =
            methods.into_iter().partition(|m| m.requires_privilege());
        info!(
            operation_id = %operation_id,
            unprivileged = unprivileged.len(),
            privileged = privileged.len(),
            "operation started"
        );

        let target = Arc::new(self.request.target_spec.clone());
        let options = Arc::new(self.request.options.clone());
        let (driver_tx, mut driver_rx) = mpsc::unbounded_channel();
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut tally = ScanTally::new();
        let mut table = HostTable::new();

        for method in unprivileged {
            tally.attempt(method);
            self.spawn_driver(&mut tasks, method, &target, &options, &driver_tx);
        }

        if !privileged.is_empty() {
            let report = self.broker.check_privilege().await;
            debug!(broker = self.broker.name(), state = %report.state, "privilege checked");

            if !report.state.is_granted() {
                for method in &privileged {
                    tally.skip(*method);
                    self.emit(ProgressRecord::Log(
                        LogLine::warn(format!("skipped {}: privilege not granted", method.label()))
                            .with_method(*method),
                    ));
                }
                if let Some(reason) = report.reason {
                    info!(%reason, "privileged methods skipped");
                }
            } else if let Some(executor) = &self.executor {
                for method in &privileged {
                    tally.attempt(*method);
                }
                let executor = executor.clone();
                let request = self.request.restricted_to(&privileged);
                let records = remote_tx.clone();
                let cancel = self.cancel.clone();
                debug!(executor = executor.name(), "privileged methods routed remotely");
                tasks.spawn(async move {
                    let completion = executor.execute(request, records, cancel).await;
                    TaskOutcome::Remote(privileged, completion)
                });
            } else {
                for method in privileged {
                    tally.attempt(method);
                    self.spawn_driver(&mut tasks, method, &target, &options, &driver_tx);
                }
            }
        }
        drop(driver_tx);
        drop(remote_tx);

        let global = tokio::time::sleep(options.global_timeout());
        tokio::pin!(global);
        let mut timed_out = false;
        let mut grace_deadline: Option<Instant> = None;
        let mut aborted = false;

        while !tasks.is_empty() {
            let grace_expiry = async move {
                match grace_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                Some(event) = driver_rx.recv() => self.accept_event(&mut table, event),
                Some(record) = remote_rx.recv() => self.accept_remote(&mut table, &mut tally, record),
                Some(joined) = tasks.join_next() => self.settle(&mut tally, joined),
                _ = &mut global, if !timed_out && grace_deadline.is_none() => {
                    warn!(operation_id = %operation_id, "global timeout reached");
                    timed_out = true;
                    self.cancel.cancel();
                }
                _ = self.cancel.cancelled(), if grace_deadline.is_none() => {
                    grace_deadline = Some(Instant::now() + self.grace);
                }
                _ = grace_expiry => {
                    warn!(outstanding = ?tally.outstanding(), "grace period over; aborting drivers");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    aborted = true;
                }
            }
        }

        while let Ok(event) = driver_rx.try_recv() {
            self.accept_event(&mut table, event);
        }
        while let Ok(record) = remote_rx.try_recv() {
            self.accept_remote(&mut table, &mut tally, record);
        }

        let unnamed = table.unnamed();
        if options.resolve_hostnames && !unnamed.is_empty() && !self.cancel.is_cancelled() {
            let lookup = self
                .names
                .clone()
                .unwrap_or_else(|| Arc::new(DnsLookup::from_system_conf()));
            let names = tokio::select! {
                names = hostnames::resolve_names(
                    lookup,
                    unnamed,
                    options.timeout(),
                    options.concurrency,
                    &self.cancel,
                ) => names,
                _ = &mut global => {
                    warn!(operation_id = %operation_id, "global timeout reached during name lookup");
                    timed_out = true;
                    Default::default()
                }
            };
            debug!(named = names.len(), "reverse names resolved");
            for (ip, name) in names {
                self.accept_host(&mut table, HostRecord::new(ip).with_hostname(name));
            }
        }

        for method in tally.outstanding() {
            if aborted || self.cancel.is_cancelled() {
                tally.settle(method);
            } else {
                tally.failed(method, "driver task ended abnormally");
            }
        }

        let cancelled_by_user = !timed_out && self.registry.cancel_requested(&operation_id);
        let state = tally.final_state(cancelled_by_user);
        tally.log_summary(&operation_id, table.len());

        let per_method = table.per_method();
        let hosts_found = table.len();
        let (methods_attempted, methods_skipped, failures) = tally.into_parts();
        let summary = ScanSummary {
            operation_id: operation_id.clone(),
            state,
            hosts_found,
            per_method,
            methods_attempted,
            methods_skipped,
            failures,
            elapsed_ms: started.elapsed().as_millis() as u64,
            timed_out,
            hosts: table.into_sorted(),
        };

        self.registry.set_state(&operation_id, state);
        self.emit(ProgressRecord::Completed(summary.clone()));
        self.registry.finish(&operation_id, state);
        info!(
            operation_id = %operation_id,
            state = %state,
            hosts = hosts_found,
            elapsed_ms = summary.elapsed_ms,
            "operation finished"
        );
        summary
    }

    fn spawn_driver(
        &self,
        tasks: &mut JoinSet<TaskOutcome>,
        method: DiscoveryMethod,
        target: &Arc<TargetSpecification>,
        options: &Arc<ScanOptions>,
        events: &mpsc::UnboundedSender<DriverEvent>,
    ) {
        let ctx = ProbeContext::new(
            target.clone(),
            options.clone(),
            EventSink::new(method, events.clone()),
            self.cancel.clone(),
        );
        tasks.spawn(async move { TaskOutcome::Driver(method, lynx_drivers::probe(method, ctx).await) });
    }

    fn emit(&self, record: ProgressRecord) {
        let _ = self.out.send(record);
    }

    /// Merge and forward a host unless the operation is being cancelled.
    fn accept_host(&self, table: &mut HostTable, record: HostRecord) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(canonical) = table.merge(record) {
            self.emit(ProgressRecord::Host(canonical));
        }
    }

    fn accept_event(&self, table: &mut HostTable, event: DriverEvent) {
        match event {
            DriverEvent::Host(record) => self.accept_host(table, record),
            DriverEvent::Log(line) => self.emit(ProgressRecord::Log(line)),
        }
    }

    fn accept_remote(&self, table: &mut HostTable, tally: &mut ScanTally, record: ProgressRecord) {
        match record {
            ProgressRecord::Host(host) => self.accept_host(table, host),
            ProgressRecord::Log(line) => self.emit(ProgressRecord::Log(line)),
            ProgressRecord::Completed(remote) => {
                for failure in remote.failures {
                    tally.failed(failure.method, failure.reason);
                }
                for method in remote.methods_skipped {
                    tally.failed(method, "privilege not available to the executor");
                }
            }
        }
    }

    fn settle(&self, tally: &mut ScanTally, joined: Result<TaskOutcome, JoinError>) {
        match joined {
            Ok(TaskOutcome::Driver(method, Ok(summary))) => {
                debug!(
                    method = %method,
                    probed = summary.targets_probed,
                    found = summary.hosts_found,
                    "driver finished"
                );
                tally.finished(summary);
            }
            Ok(TaskOutcome::Driver(method, Err(e))) => {
                warn!(method = %method, error = %e, "driver failed");
                self.emit(ProgressRecord::Log(
                    LogLine::warn(format!("{} failed: {e}", method.label())).with_method(method),
                ));
                tally.failed(method, e.to_string());
            }
            Ok(TaskOutcome::Remote(methods, Ok(completion))) => {
                if !completion.ok && !self.cancel.is_cancelled() {
                    let reason = completion
                        .error_message
                        .unwrap_or_else(|| "privileged execution failed".to_string());
                    for method in &methods {
                        tally.failed(*method, reason.clone());
                    }
                }
                for method in methods {
                    tally.settle(method);
                }
            }
            Ok(TaskOutcome::Remote(methods, Err(e))) => {
                warn!(error = %e, "privileged executor failed");
                let reason = format!("{e:#}");
                for method in methods {
                    self.emit(ProgressRecord::Log(
                        LogLine::warn(format!("{} failed: {reason}", method.label()))
                            .with_method(method),
                    ));
                    tally.failed(method, reason.clone());
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(error = %e, "driver task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lynx_common::{
        LogLevel, MethodFailure, PortRange, PrivilegeReport, PrivilegeState, RecordSink,
        SetupError,
    };
    use std::collections::BTreeMap;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    struct FixedBroker(PrivilegeState);

    #[async_trait]
    impl PrivilegeBroker for FixedBroker {
        async fn check_privilege(&self) -> PrivilegeReport {
            PrivilegeReport::new(self.0)
        }

        async fn request_setup(&self) -> Result<(), SetupError> {
            Err(SetupError::Unsupported("test broker".into()))
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    /// Scripted executor behaviours.
    enum Script {
        Fail,
        ExitCode2,
        WaitForCancel,
        IgnoreCancel,
        EchoHost(IpAddr),
        RemoteSummary(Vec<MethodFailure>, Vec<DiscoveryMethod>),
    }

    struct ScriptedExecutor(Script);

    #[async_trait]
    impl PrivilegedExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            request: ScanRequest,
            records: RecordSink,
            cancel: CancellationToken,
        ) -> Result<Completion> {
            match &self.0 {
                Script::Fail => bail!("daemon unreachable"),
                Script::ExitCode2 => Ok(Completion::failure("worker exited with code 2")),
                Script::WaitForCancel => {
                    cancel.cancelled().await;
                    Ok(Completion::cancelled())
                }
                Script::IgnoreCancel => {
                    let first = HostRecord::new("10.0.0.1".parse().unwrap())
                        .with_method(DiscoveryMethod::IcmpEcho);
                    let _ = records.send(ProgressRecord::Host(first));
                    cancel.cancelled().await;
                    let late = HostRecord::new("10.0.0.2".parse().unwrap())
                        .with_method(DiscoveryMethod::IcmpEcho);
                    let _ = records.send(ProgressRecord::Host(late));
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Completion::success())
                }
                Script::EchoHost(ip) => {
                    let host = HostRecord::new(*ip)
                        .with_method(DiscoveryMethod::IcmpEcho)
                        .with_latency(Duration::from_micros(250));
                    let _ = records.send(ProgressRecord::Host(host));
                    Ok(Completion::success())
                }
                Script::RemoteSummary(failures, skipped) => {
                    let summary = ScanSummary {
                        operation_id: request.operation_id.clone(),
                        state: OperationState::Completed,
                        hosts_found: 0,
                        per_method: BTreeMap::new(),
                        methods_attempted: request.methods.clone(),
                        methods_skipped: skipped.clone(),
                        failures: failures.clone(),
                        elapsed_ms: 1,
                        timed_out: false,
                        hosts: Vec::new(),
                    };
                    let _ = records.send(ProgressRecord::Completed(summary));
                    Ok(Completion::success())
                }
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn orchestrator(state: PrivilegeState, script: Option<Script>) -> Orchestrator {
        let orch = Orchestrator::new(Arc::new(FixedBroker(state)));
        match script {
            Some(script) => orch.with_executor(Arc::new(ScriptedExecutor(script))),
            None => orch,
        }
    }

    async fn listener(addr: &str) -> u16 {
        let listener = TcpListener::bind(addr).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        port
    }

    fn spec(block: &str, port: u16) -> TargetSpecification {
        TargetSpecification::new(vec![block.parse().unwrap()])
            .with_ports(vec![PortRange::single(port)])
    }

    fn quick() -> ScanOptions {
        ScanOptions::default()
            .with_timeout(Duration::from_millis(500))
            .with_retries(0)
    }

    async fn drain(handle: &mut ScanHandle) -> Vec<ProgressRecord> {
        let mut records = Vec::new();
        while let Some(r) = handle.next_record().await {
            records.push(r);
        }
        records
    }

    #[tokio::test]
    async fn missing_privilege_skips_privileged_methods() {
        let port = listener("127.0.0.1:0").await;
        let orch = orchestrator(PrivilegeState::NotRegistered, None);
        let methods = vec![
            DiscoveryMethod::TcpConnect,
            DiscoveryMethod::IcmpEcho,
            DiscoveryMethod::ArpScan,
        ];

        let mut handle = orch.run_scan(spec("127.0.0.1", port), methods, quick()).unwrap();
        let records = drain(&mut handle).await;
        let summary = handle.finish().await.unwrap();

        let warnings: Vec<&str> = records
            .iter()
            .filter_map(|r| match r {
                ProgressRecord::Log(l) if l.level == LogLevel::Warn => Some(l.message.as_str()),
                _ => None,
            })
            .collect();
        assert!(warnings.contains(&"skipped ICMP: privilege not granted"));
        assert!(warnings.contains(&"skipped ARP: privilege not granted"));

        assert_eq!(summary.state, OperationState::Completed);
        assert_eq!(summary.methods_attempted, vec![DiscoveryMethod::TcpConnect]);
        assert_eq!(
            summary.methods_skipped,
            vec![DiscoveryMethod::IcmpEcho, DiscoveryMethod::ArpScan]
        );
        assert!(summary.failures.is_empty());
        assert_eq!(summary.hosts_found, 1);
        assert!(matches!(records.last(), Some(ProgressRecord::Completed(_))));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn slash_30_reports_only_the_listening_address() {
        let port = listener("127.0.0.2:0").await;
        let orch = orchestrator(PrivilegeState::NotRegistered, None);

        let target = spec("127.0.0.0/30", port);
        assert_eq!(target.address_count(), 4);

        let mut handle = orch
            .run_scan(target, vec![DiscoveryMethod::TcpConnect], quick())
            .unwrap();
        let records = drain(&mut handle).await;
        let summary = handle.finish().await.unwrap();

        let expected: IpAddr = "127.0.0.2".parse().unwrap();
        assert_eq!(summary.hosts.len(), 1);
        assert_eq!(summary.hosts[0].address, expected);
        assert!(summary.hosts[0].open_ports.contains(&port));
        assert!(records.iter().all(|r| match r {
            ProgressRecord::Host(h) => h.address == expected,
            _ => true,
        }));
        assert_eq!(summary.per_method[&DiscoveryMethod::TcpConnect], 1);
    }

    #[tokio::test]
    async fn cancel_stops_forwarding_and_ends_within_grace() {
        let orch = orchestrator(PrivilegeState::Granted, Some(Script::IgnoreCancel));
        let mut handle = orch
            .run_scan(
                TargetSpecification::new(vec!["10.0.0.0/30".parse().unwrap()]),
                vec![DiscoveryMethod::IcmpEcho],
                ScanOptions::default(),
            )
            .unwrap();

        loop {
            match handle.next_record().await {
                Some(ProgressRecord::Host(_)) => break,
                Some(_) => continue,
                None => panic!("stream ended before the first host"),
            }
        }

        let cancelled_at = std::time::Instant::now();
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let rest = drain(&mut handle).await;
        let summary = handle.finish().await.unwrap();

        assert!(cancelled_at.elapsed() < DEFAULT_GRACE + Duration::from_secs(1));
        assert_eq!(summary.state, OperationState::Cancelled);
        assert!(!rest.iter().any(|r| matches!(r, ProgressRecord::Host(_))));
        assert_eq!(summary.hosts_found, 1);
        assert!(orch.registry().is_empty());
        assert!(!orch.cancel(&summary.operation_id));
    }

    #[tokio::test]
    async fn executor_failure_fails_only_privileged_methods() {
        let port = listener("127.0.0.1:0").await;
        let orch = orchestrator(PrivilegeState::Granted, Some(Script::Fail));
        let methods = vec![
            DiscoveryMethod::TcpConnect,
            DiscoveryMethod::IcmpEcho,
            DiscoveryMethod::TcpSyn,
        ];

        let handle = orch.run_scan(spec("127.0.0.1", port), methods, quick()).unwrap();
        let summary = handle.finish().await.unwrap();

        let failed: Vec<DiscoveryMethod> = summary.failures.iter().map(|f| f.method).collect();
        assert_eq!(failed, vec![DiscoveryMethod::IcmpEcho, DiscoveryMethod::TcpSyn]);
        assert!(summary.failures[0].reason.contains("daemon unreachable"));
        assert_eq!(summary.state, OperationState::Completed);
        assert_eq!(summary.hosts_found, 1);
    }

    #[tokio::test]
    async fn all_methods_failing_fails_the_operation() {
        let orch = orchestrator(PrivilegeState::Granted, Some(Script::ExitCode2));
        let handle = orch
            .run_scan(
                spec("127.0.0.1", 80),
                vec![DiscoveryMethod::IcmpEcho],
                quick(),
            )
            .unwrap();
        let summary = handle.finish().await.unwrap();

        assert_eq!(summary.state, OperationState::Failed);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].reason, "worker exited with code 2");
    }

    #[tokio::test]
    async fn global_timeout_cancels_and_flags_the_summary() {
        let orch = orchestrator(PrivilegeState::Granted, Some(Script::WaitForCancel));
        let options = quick().with_global_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();

        let handle = orch
            .run_scan(spec("127.0.0.1", 80), vec![DiscoveryMethod::ArpScan], options)
            .unwrap();
        let summary = handle.finish().await.unwrap();

        assert!(summary.timed_out);
        assert_eq!(summary.state, OperationState::Completed);
        assert!(summary.failures.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn remote_and_local_reports_merge() {
        let port = listener("127.0.0.1:0").await;
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let orch = orchestrator(PrivilegeState::Granted, Some(Script::EchoHost(ip)));

        let handle = orch
            .run_scan(
                spec("127.0.0.1", port),
                vec![DiscoveryMethod::TcpConnect, DiscoveryMethod::IcmpEcho],
                quick(),
            )
            .unwrap();
        let summary = handle.finish().await.unwrap();

        assert_eq!(summary.hosts.len(), 1);
        let host = &summary.hosts[0];
        assert!(host.methods.contains(&DiscoveryMethod::TcpConnect));
        assert!(host.methods.contains(&DiscoveryMethod::IcmpEcho));
        assert_eq!(summary.per_method[&DiscoveryMethod::IcmpEcho], 1);
    }

    #[tokio::test]
    async fn remote_summary_failures_are_adopted() {
        let failures = vec![MethodFailure {
            method: DiscoveryMethod::TcpSyn,
            reason: "raw IPv4 socket: permission denied".into(),
        }];
        let script = Script::RemoteSummary(failures, vec![DiscoveryMethod::ArpScan]);
        let orch = orchestrator(PrivilegeState::Granted, Some(script));

        let handle = orch
            .run_scan(
                spec("127.0.0.1", 80),
                vec![
                    DiscoveryMethod::IcmpEcho,
                    DiscoveryMethod::ArpScan,
                    DiscoveryMethod::TcpSyn,
                ],
                quick(),
            )
            .unwrap();
        let summary = handle.finish().await.unwrap();

        let mut failed: Vec<DiscoveryMethod> = summary.failures.iter().map(|f| f.method).collect();
        failed.sort();
        assert_eq!(failed, vec![DiscoveryMethod::ArpScan, DiscoveryMethod::TcpSyn]);
        assert_eq!(summary.state, OperationState::Completed);
    }

    #[tokio::test]
    async fn duplicate_operation_ids_are_rejected() {
        let orch = orchestrator(PrivilegeState::Granted, Some(Script::WaitForCancel));
        let request = ScanRequest::new(spec("127.0.0.1", 80), vec![DiscoveryMethod::IcmpEcho])
            .with_operation_id("op-dup");

        let handle = orch.run_request(request.clone()).unwrap();
        assert!(orch.run_request(request).is_err());

        assert!(orch.cancel("op-dup"));
        let summary = handle.finish().await.unwrap();
        assert_eq!(summary.operation_id, "op-dup");
        assert_eq!(summary.state, OperationState::Cancelled);
        assert!(!orch.cancel("op-dup"));
    }

    #[tokio::test]
    async fn empty_method_list_completes_immediately() {
        let orch = orchestrator(PrivilegeState::NotRegistered, None);
        let mut handle = orch
            .run_scan(TargetSpecification::default(), Vec::new(), quick())
            .unwrap();
        let records = drain(&mut handle).await;
        let summary = handle.finish().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(summary.state, OperationState::Completed);
        assert_eq!(summary.hosts_found, 0);
    }

    struct Named(&'static str);

    #[async_trait]
    impl NameLookup for Named {
        async fn reverse_lookup(&self, _: IpAddr) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn discovered_hosts_get_reverse_names() {
        let port = listener("127.0.0.1:0").await;
        let orch = orchestrator(PrivilegeState::Granted, None)
            .with_name_lookup(Arc::new(Named("box.lan")));
        let mut handle = orch
            .run_scan(
                spec("127.0.0.1/32", port),
                vec![DiscoveryMethod::TcpConnect],
                ScanOptions::default().with_resolve_hostnames(true),
            )
            .unwrap();

        let records = drain(&mut handle).await;
        let summary = handle.finish().await.unwrap();

        assert!(records.iter().any(|r| matches!(
            r,
            ProgressRecord::Host(h) if h.hostname.as_deref() == Some("box.lan")
        )));
        assert_eq!(summary.hosts.len(), 1);
        assert_eq!(summary.hosts[0].hostname.as_deref(), Some("box.lan"));
        assert_eq!(summary.per_method.get(&DiscoveryMethod::TcpConnect), Some(&1));
    }

    #[tokio::test]
    async fn names_are_not_looked_up_unless_asked() {
        let port = listener("127.0.0.1:0").await;
        let orch = orchestrator(PrivilegeState::Granted, None)
            .with_name_lookup(Arc::new(Named("box.lan")));
        let mut handle = orch
            .run_scan(
                spec("127.0.0.1/32", port),
                vec![DiscoveryMethod::TcpConnect],
                ScanOptions::default(),
            )
            .unwrap();

        drain(&mut handle).await;
        let summary = handle.finish().await.unwrap();
        assert_eq!(summary.hosts.len(), 1);
        assert_eq!(summary.hosts[0].hostname, None);
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected_before_starting() {
        let orch = orchestrator(PrivilegeState::Granted, None);
        let everything = orch.run_scan(
            TargetSpecification::new(vec!["::/0".parse().unwrap()]),
            vec![DiscoveryMethod::TcpConnect],
            ScanOptions::default(),
        );
        assert!(everything.is_err());

        let endless = orch.run_scan(
            TargetSpecification::new(vec!["127.0.0.1/32".parse().unwrap()]),
            vec![DiscoveryMethod::TcpConnect],
            ScanOptions::default().with_retries(u32::MAX),
        );
        assert!(endless.is_err());
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_large_block_ends_within_grace() {
        let orch = orchestrator(PrivilegeState::Granted, None).with_host_limit(u128::MAX);
        let mut handle = orch
            .run_scan(
                spec("127.0.0.0/8", 9),
                vec![DiscoveryMethod::TcpConnect],
                ScanOptions::default(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancelled_at = std::time::Instant::now();
        assert!(handle.cancel());

        let summary = tokio::time::timeout(DEFAULT_GRACE + Duration::from_secs(1), async {
            drain(&mut handle).await;
            handle.finish().await.unwrap()
        })
        .await
        .expect("cancelled scan kept running");

        assert!(cancelled_at.elapsed() < DEFAULT_GRACE + Duration::from_secs(1));
        assert_eq!(summary.state, OperationState::Cancelled);
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_operation() {
        let orch = orchestrator(PrivilegeState::Granted, Some(Script::WaitForCancel));
        let handle = orch
            .run_scan(
                TargetSpecification::new(vec!["10.0.0.0/30".parse().unwrap()]),
                vec![DiscoveryMethod::IcmpEcho],
                ScanOptions::default(),
            )
            .unwrap();
        let operation_id = handle.operation_id().to_string();
        drop(handle);

        assert!(orch.registry().cancel_requested(&operation_id) || orch.registry().is_empty());
        tokio::time::timeout(Duration::from_secs(2), async {
            while !orch.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dropped operation kept running");
    }
}
