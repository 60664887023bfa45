//! Daemon side of the channel
//!
//! Each accepted connection is authenticated, then served frame by frame.
//! Discover and scan calls run `lynx-worker` under the [`Supervisor`]; the
//! daemon itself never touches a raw socket.

use crate::auth::{CallerVerifier, ExecutableVerifier, PeerCredentials};
use crate::protocol::{Call, Reply, Request, Response, CONNECTION_FRAME};
use dashmap::DashMap;
use lynx_common::{codec, Completion, PrivilegeBroker, ProcessError, ScanMode, WorkerCommand};
use lynx_privilege::ProcessBroker;
use lynx_supervisor::{Supervisor, WorkerBinary};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

struct ServerContext {
    verifier: Box<dyn CallerVerifier>,
    broker: Box<dyn PrivilegeBroker>,
    supervisor: Supervisor,
    worker: WorkerBinary,
}

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    context: ServerContext,
}

impl IpcServer {
    /// Bind `path`, replacing a stale socket file.
    ///
    /// The socket is world-connectable; the verifier decides who is served.
    /// It defaults to callers installed beside this executable.
    pub fn bind(path: impl AsRef<Path>, worker: WorkerBinary) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;

        Ok(Self {
            listener,
            path,
            context: ServerContext {
                verifier: Box::new(ExecutableVerifier::beside_current_exe()?),
                broker: Box::new(ProcessBroker),
                supervisor: Supervisor::new(),
                worker,
            },
        })
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: impl CallerVerifier + 'static) -> Self {
        self.context.verifier = Box::new(verifier);
        self
    }

    #[must_use]
    pub fn with_broker(mut self, broker: impl PrivilegeBroker + 'static) -> Self {
        self.context.broker = Box::new(broker);
        self
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.context.supervisor = supervisor;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires, then remove the socket.
    #[instrument(skip(self, shutdown), fields(path = %self.path.display()))]
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let Self {
            listener,
            path,
            context,
        } = self;
        let context = Arc::new(context);
        info!("daemon listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(stream, context.clone(), shutdown.child_token()));
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }

        info!("daemon stopping");
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(error = %e, "socket cleanup failed");
        }
        Ok(())
    }
}

async fn serve_connection(stream: UnixStream, context: Arc<ServerContext>, shutdown: CancellationToken) {
    let peer = match PeerCredentials::from_stream(&stream) {
        Ok(peer) => peer,
        Err(e) => {
            warn!(error = %e, "no peer credentials, dropping connection");
            return;
        }
    };

    let (read, mut write) = stream.into_split();
    if !context.verifier.verify_caller(&peer) {
        warn!(uid = peer.uid, pid = ?peer.pid, exe = ?peer.executable, "caller rejected");
        let frame = Response::new(
            CONNECTION_FRAME,
            Reply::Rejected {
                reason: "caller is not trusted".to_string(),
            },
        );
        let _ = codec::write_line(&mut write, &frame).await;
        return;
    }
    info!(uid = peer.uid, pid = ?peer.pid, "caller connected");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(write_frames(write, out_rx));
    let connection = Connection {
        context,
        owned: Arc::new(DashMap::new()),
        out: out_tx,
    };

    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "connection read failed");
                    break;
                }
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        match codec::decode_line::<Request>(&line) {
            Ok(request) => connection.dispatch(request).await,
            Err(e) => connection.reply(
                CONNECTION_FRAME,
                Reply::Error {
                    message: format!("malformed frame: {e}"),
                },
            ),
        }
    }

    connection.close();
    drop(connection);
    let _ = writer.await;
    debug!(uid = peer.uid, "caller disconnected");
}

async fn write_frames(mut write: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Response>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = codec::write_line(&mut write, &frame).await {
            debug!(error = %e, "connection write failed");
            break;
        }
    }
}

/// Per-connection state: which operations this caller started, with the
/// supervisor generation of each.
struct Connection {
    context: Arc<ServerContext>,
    owned: Arc<DashMap<String, u64>>,
    out: mpsc::UnboundedSender<Response>,
}

impl Connection {
    fn reply(&self, id: u64, reply: Reply) {
        let _ = self.out.send(Response::new(id, reply));
    }

    async fn dispatch(&self, request: Request) {
        let Request { id, call } = request;
        debug!(id, call = call.name(), "call");
        match call {
            Call::Ping => self.reply(id, Reply::Pong),
            Call::CheckPrivileges => {
                let report = self.context.broker.check_privilege().await;
                self.reply(
                    id,
                    Reply::Privileges {
                        ok: true,
                        is_privileged: report.state.is_granted(),
                        reason: report.reason,
                    },
                );
            }
            Call::Discover(mut request) => {
                request.options.mode = ScanMode::Discover;
                self.start(id, WorkerCommand::Discover(request)).await;
            }
            Call::Scan(mut request) => {
                request.options.mode = ScanMode::Scan;
                self.start(id, WorkerCommand::Scan(request)).await;
            }
            Call::Cancel { operation_id } => {
                let cancelled = self
                    .owned
                    .remove(&operation_id)
                    .map(|(_, generation)| {
                        self.context
                            .supervisor
                            .cancel_generation(&operation_id, generation)
                    })
                    .unwrap_or(false);
                self.reply(id, Reply::Cancelled { cancelled });
            }
        }
    }

    async fn start(&self, id: u64, command: WorkerCommand) {
        let operation_id = match &command {
            WorkerCommand::Discover(r) | WorkerCommand::Scan(r) => {
                if let Err(e) = r.validate() {
                    warn!(operation_id = %r.operation_id, error = %e, "request refused");
                    self.reply(id, Reply::Completion(Completion::failure(e.to_string())));
                    return;
                }
                r.operation_id.clone()
            }
            WorkerCommand::Check | WorkerCommand::Methods => return,
        };
        let payload = match codec::encode_line(&command) {
            Ok(payload) => payload,
            Err(e) => {
                self.reply(id, Reply::Completion(Completion::failure(e.to_string())));
                return;
            }
        };

        let out = self.out.clone();
        let on_progress = move |line: String| {
            let _ = out.send(Response::new(id, Reply::Progress { line }));
        };
        let op = operation_id.clone();
        let on_log = move |line: String| debug!(target: "lynx::worker", operation_id = %op, "{line}");

        let spawned = self
            .context
            .supervisor
            .spawn(&operation_id, &self.context.worker, &payload, on_progress, on_log)
            .await;
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                if !matches!(e, ProcessError::Duplicate(_)) {
                    error!(%operation_id, error = %e, "worker spawn failed");
                }
                self.reply(id, Reply::Completion(Completion::failure(e.to_string())));
                return;
            }
        };
        let generation = handle.generation();
        info!(%operation_id, generation, "operation started");
        self.owned.insert(operation_id.clone(), generation);

        let owned = self.owned.clone();
        let out = self.out.clone();
        tokio::spawn(async move {
            let completion = handle.wait().await;
            owned.remove_if(&operation_id, |_, g| *g == generation);
            let _ = out.send(Response::new(id, Reply::Completion(completion)));
        });
    }

    /// Cancel everything this caller still has running.
    fn close(&self) {
        for entry in self.owned.iter() {
            let (operation_id, generation) = entry.pair();
            if self.context.supervisor.cancel_generation(operation_id, *generation) {
                info!(%operation_id, "cancelled on disconnect");
            }
        }
        self.owned.clear();
    }
}
