//! Daemon client
//!
//! One connection multiplexes any number of calls. A reader task routes
//! response frames to the call that owns their `id`; streaming calls come
//! back as a [`RemoteOperation`].

use crate::protocol::{Call, Reply, Request, Response, CONNECTION_FRAME};
use dashmap::DashMap;
use lynx_common::{codec, Completion, IpcError, ProgressRecord, ScanRequest};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Ceiling for unary calls and for whole streaming operations.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(600);

/// Answer to `check_privileges`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeCheck {
    pub ok: bool,
    pub is_privileged: bool,
    pub reason: Option<String>,
}

#[derive(Default)]
struct Routes {
    pending: DashMap<u64, mpsc::UnboundedSender<Reply>>,
    rejection: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl Routes {
    /// Why replies stopped: a rejection frame, or the connection going away.
    fn closed_error(&self) -> IpcError {
        match self.rejection.lock().ok().and_then(|r| r.clone()) {
            Some(reason) => IpcError::Rejected(reason),
            None => IpcError::ConnectionClosed,
        }
    }
}

pub struct IpcClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    routes: Arc<Routes>,
    next_id: AtomicU64,
    ceiling: Duration,
    reader: JoinHandle<()>,
}

impl IpcClient {
    #[instrument(fields(path = %path.as_ref().display()), skip(path))]
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| IpcError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read, write) = stream.into_split();
        let routes = Arc::new(Routes::default());
        let reader = tokio::spawn(route_replies(read, routes.clone()));
        debug!("connected to daemon");

        Ok(Self {
            writer: tokio::sync::Mutex::new(write),
            routes,
            next_id: AtomicU64::new(CONNECTION_FRAME + 1),
            ceiling: DEFAULT_CEILING,
            reader,
        })
    }

    #[inline]
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub async fn ping(&self) -> Result<bool, IpcError> {
        match self.unary(Call::Ping).await? {
            Reply::Pong => Ok(true),
            other => Err(unexpected("ping", &other)),
        }
    }

    pub async fn check_privileges(&self) -> Result<PrivilegeCheck, IpcError> {
        match self.unary(Call::CheckPrivileges).await? {
            Reply::Privileges {
                ok,
                is_privileged,
                reason,
            } => Ok(PrivilegeCheck {
                ok,
                is_privileged,
                reason,
            }),
            other => Err(unexpected("check_privileges", &other)),
        }
    }

    /// Start a host discovery in the daemon.
    pub async fn discover(&self, request: ScanRequest) -> Result<RemoteOperation, IpcError> {
        self.stream(Call::Discover(request)).await
    }

    /// Start a port scan in the daemon.
    pub async fn scan(&self, request: ScanRequest) -> Result<RemoteOperation, IpcError> {
        self.stream(Call::Scan(request)).await
    }

    /// Cancel an operation started on this connection.
    pub async fn cancel(&self, operation_id: &str) -> Result<bool, IpcError> {
        let call = Call::Cancel {
            operation_id: operation_id.to_string(),
        };
        match self.unary(call).await? {
            Reply::Cancelled { cancelled } => Ok(cancelled),
            other => Err(unexpected("cancel", &other)),
        }
    }

    async fn unary(&self, call: Call) -> Result<Reply, IpcError> {
        let (id, mut replies) = self.send(call).await?;
        let outcome = tokio::time::timeout(self.ceiling, replies.recv()).await;
        self.routes.pending.remove(&id);
        match outcome {
            Err(_) => Err(IpcError::Timeout(self.ceiling)),
            Ok(None) => Err(self.routes.closed_error()),
            Ok(Some(Reply::Error { message })) => Err(IpcError::Protocol(message)),
            Ok(Some(reply)) => Ok(reply),
        }
    }

    async fn stream(&self, call: Call) -> Result<RemoteOperation, IpcError> {
        let operation_id = match &call {
            Call::Discover(r) | Call::Scan(r) => r.operation_id.clone(),
            _ => String::new(),
        };
        let (id, replies) = self.send(call).await?;
        Ok(RemoteOperation {
            operation_id,
            id,
            replies,
            routes: self.routes.clone(),
            ceiling: self.ceiling,
            deadline: Instant::now() + self.ceiling,
            completion: None,
        })
    }

    /// Register a route for a fresh ID and write the frame.
    ///
    /// A failed write is not reported here: the reader notices the broken
    /// connection and the caller sees why it closed.
    async fn send(&self, call: Call) -> Result<(u64, mpsc::UnboundedReceiver<Reply>), IpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.pending.insert(id, tx);
        if self.routes.closed.load(Ordering::SeqCst) {
            self.routes.pending.remove(&id);
            return Err(self.routes.closed_error());
        }
        debug!(id, call = call.name(), "sending call");

        let frame = Request { id, call };
        let mut writer = self.writer.lock().await;
        if let Err(e) = codec::write_line(&mut *writer, &frame).await {
            debug!(id, error = %e, "write failed");
        }
        Ok((id, rx))
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn route_replies(read: OwnedReadHalf, routes: Arc<Routes>) {
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "daemon connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response: Response = match codec::decode_line(&line) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame from daemon");
                continue;
            }
        };

        if response.id == CONNECTION_FRAME {
            if let Reply::Rejected { reason } = response.reply {
                if let Ok(mut slot) = routes.rejection.lock() {
                    *slot = Some(reason);
                }
                break;
            }
            continue;
        }

        let last = response.reply.is_final();
        match routes.pending.get(&response.id) {
            Some(route) => {
                let _ = route.send(response.reply);
            }
            None => debug!(id = response.id, "reply for unknown call"),
        }
        if last {
            routes.pending.remove(&response.id);
        }
    }
    // Dropping every route wakes all waiting calls.
    routes.closed.store(true, Ordering::SeqCst);
    routes.pending.clear();
}

fn unexpected(call: &str, reply: &Reply) -> IpcError {
    IpcError::Protocol(format!("unexpected reply to {call}: {reply:?}"))
}

/// A discover or scan running in the daemon.
///
/// Drain [`next_record`](Self::next_record) until it returns `None`, then
/// take [`completion`](Self::completion).
pub struct RemoteOperation {
    operation_id: String,
    id: u64,
    replies: mpsc::UnboundedReceiver<Reply>,
    routes: Arc<Routes>,
    ceiling: Duration,
    deadline: Instant,
    completion: Option<Completion>,
}

impl RemoteOperation {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Next decoded progress record; `None` once the completion arrived.
    /// Lines the codec does not recognise are skipped.
    pub async fn next_record(&mut self) -> Result<Option<ProgressRecord>, IpcError> {
        if self.completion.is_some() {
            return Ok(None);
        }
        loop {
            let reply = match tokio::time::timeout_at(self.deadline, self.replies.recv()).await {
                Err(_) => return Err(IpcError::Timeout(self.ceiling)),
                Ok(None) => return Err(self.routes.closed_error()),
                Ok(Some(reply)) => reply,
            };
            match reply {
                Reply::Progress { line } => match codec::decode_record(&line) {
                    Ok(Some(record)) => return Ok(Some(record)),
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "skipping malformed progress line"),
                },
                Reply::Completion(completion) => {
                    self.completion = Some(completion);
                    return Ok(None);
                }
                Reply::Error { message } => return Err(IpcError::Protocol(message)),
                other => return Err(unexpected("discover", &other)),
            }
        }
    }

    /// The terminal completion, discarding any records not yet read.
    pub async fn completion(mut self) -> Result<Completion, IpcError> {
        while self.next_record().await?.is_some() {}
        self.completion
            .take()
            .ok_or_else(|| IpcError::Protocol("stream ended without completion".to_string()))
    }
}

impl Drop for RemoteOperation {
    fn drop(&mut self) {
        self.routes.pending.remove(&self.id);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::server::IpcServer;
    use crate::test_support::{sh_worker, socket_path};
    use lynx_common::{DiscoveryMethod, TargetSpecification};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn connect_to_missing_socket() {
        let err = IpcClient::connect("/nonexistent/lynx.sock")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::Connect { .. }));
    }

    #[tokio::test]
    async fn operation_ceiling_yields_timeout() {
        let path = socket_path();
        let server = IpcServer::bind(&path, sh_worker("exec sleep 30"))
            .unwrap()
            .with_verifier(|_: &crate::PeerCredentials| true);
        let shutdown = CancellationToken::new();
        let served = tokio::spawn(server.run(shutdown.clone()));

        let client = IpcClient::connect(&path)
            .await
            .unwrap()
            .with_ceiling(Duration::from_millis(300));
        let request = ScanRequest::new(
            TargetSpecification::new(vec!["10.0.0.1".parse().unwrap()]),
            vec![DiscoveryMethod::IcmpEcho],
        );
        let mut operation = client.discover(request).await.unwrap();
        let err = operation.next_record().await.unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)));

        drop(operation);
        drop(client);
        shutdown.cancel();
        served.await.unwrap().unwrap();
    }
}
