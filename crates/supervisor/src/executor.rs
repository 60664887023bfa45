//! Privileged execution in a local worker subprocess

use crate::supervisor::{Supervisor, WorkerBinary};
use async_trait::async_trait;
use lynx_common::{
    codec, Completion, PrivilegedExecutor, RecordSink, ScanRequest, WorkerCommand,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Runs each request in a fresh worker process owned by a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SubprocessExecutor {
    supervisor: Supervisor,
    worker: WorkerBinary,
}

impl SubprocessExecutor {
    pub fn new(worker: WorkerBinary) -> Self {
        Self {
            supervisor: Supervisor::new(),
            worker,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

#[async_trait]
impl PrivilegedExecutor for SubprocessExecutor {
    #[instrument(skip(self, request, records, cancel), fields(operation_id = %request.operation_id))]
    async fn execute(
        &self,
        request: ScanRequest,
        records: RecordSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<Completion> {
        let operation_id = request.operation_id.clone();
        let payload = codec::encode_line(&WorkerCommand::for_request(request))?;

        let on_progress = move |line: String| match codec::decode_record(&line) {
            Ok(Some(record)) => {
                let _ = records.send(record);
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "skipping malformed worker line"),
        };
        let on_log = |line: String| debug!(target: "lynx::worker", "{line}");

        let handle = self
            .supervisor
            .spawn(&operation_id, &self.worker, &payload, on_progress, on_log)
            .await?;

        let wait = handle.wait();
        tokio::pin!(wait);
        let completion = tokio::select! {
            completion = &mut wait => completion,
            _ = cancel.cancelled() => {
                self.supervisor.cancel(&operation_id);
                wait.await
            }
        };
        Ok(completion)
    }

    fn name(&self) -> &str {
        "subprocess"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::sh_worker;
    use lynx_common::{DiscoveryMethod, ProgressRecord, TargetSpecification};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn request() -> ScanRequest {
        let spec = TargetSpecification::new(vec!["10.0.0.1".parse().unwrap()]);
        ScanRequest::new(spec, vec![DiscoveryMethod::IcmpEcho]).with_operation_id("op-sub")
    }

    #[tokio::test]
    async fn worker_lines_become_records() {
        let worker = sh_worker(
            r#"read request
echo '{"type":"host","address":"10.0.0.1","methods":["icmp_echo"],"discoveredAt":"2024-01-01T00:00:00Z"}'
echo 'not json'
echo '{"type":"telemetry"}'
echo 'progress' >&2"#,
        );
        let executor = SubprocessExecutor::new(worker);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let completion = executor
            .execute(request(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(completion.ok);

        let mut hosts = Vec::new();
        while let Ok(record) = rx.try_recv() {
            if let ProgressRecord::Host(host) = record {
                hosts.push(host.address);
            }
        }
        assert_eq!(hosts, vec!["10.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn cancel_kills_the_worker() {
        let executor = SubprocessExecutor::new(sh_worker("exec sleep 30"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let completion = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(request(), tx, cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(completion, Completion::cancelled());
        assert_eq!(executor.supervisor().active_count(), 0);
    }

    #[tokio::test]
    async fn request_reaches_worker_stdin() {
        let worker = sh_worker(
            r#"read request
case "$request" in
  *'"type":"discover"'*'"operationId":"op-sub"'*) exit 0 ;;
  *) exit 3 ;;
esac"#,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let completion = SubprocessExecutor::new(worker)
            .execute(request(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(completion.ok, "{completion:?}");
    }
}
