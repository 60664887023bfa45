//! Worker process lifecycle

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lynx_common::{Completion, ProcessError};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Program (and leading arguments) to run as the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBinary {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerBinary {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[derive(Debug)]
struct ActiveProcess {
    generation: u64,
    cancel: CancellationToken,
}

/// Live worker processes by operation ID.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    active: Arc<DashMap<String, ActiveProcess>>,
    generation: Arc<AtomicU64>,
}

/// A supervised worker. [`wait`](Self::wait) yields its completion.
#[derive(Debug)]
pub struct ProcessHandle {
    operation_id: String,
    generation: u64,
    task: JoinHandle<Completion>,
}

impl ProcessHandle {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Spawn counter value for this worker; pass it to
    /// [`Supervisor::cancel_generation`] so a later reuse of the ID is untouched.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Completion of the worker, after every output line was delivered.
    pub async fn wait(self) -> Completion {
        match self.task.await {
            Ok(completion) => completion,
            Err(e) => Completion::failure(format!("supervisor task failed: {e}")),
        }
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `worker` for `operation_id` and send it `payload` as one line.
    ///
    /// `on_progress` gets every complete stdout line, `on_log` every stderr
    /// line. Both stop being called once the operation is cancelled.
    #[instrument(skip(self, payload, on_progress, on_log), fields(program = %worker.program.display()))]
    pub async fn spawn<P, L>(
        &self,
        operation_id: &str,
        worker: &WorkerBinary,
        payload: &str,
        on_progress: P,
        on_log: L,
    ) -> Result<ProcessHandle, ProcessError>
    where
        P: FnMut(String) + Send + 'static,
        L: FnMut(String) + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        match self.active.entry(operation_id.to_string()) {
            Entry::Occupied(_) => return Err(ProcessError::Duplicate(operation_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ActiveProcess {
                    generation,
                    cancel: cancel.clone(),
                });
            }
        }

        let mut child = match Command::new(&worker.program)
            .args(&worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                self.release(operation_id, generation);
                return Err(ProcessError::Spawn {
                    program: worker.program.clone(),
                    source,
                });
            }
        };
        debug!(operation_id, pid = child.id(), "worker spawned");

        if let Err(e) = write_payload(&mut child, payload).await {
            let _ = child.kill().await;
            self.release(operation_id, generation);
            return Err(ProcessError::Stdin(e));
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            self.release(operation_id, generation);
            return Err(ProcessError::Io(std::io::Error::other("worker pipes unavailable")));
        };

        let supervisor = self.clone();
        let id = operation_id.to_string();
        let task = tokio::spawn(async move {
            let completion = supervise(child, stdout, stderr, &cancel, on_progress, on_log).await;
            supervisor.release(&id, generation);
            info!(operation_id = %id, ok = completion.ok, "worker finished");
            completion
        });

        Ok(ProcessHandle {
            operation_id: operation_id.to_string(),
            generation,
            task,
        })
    }

    /// Kill the worker for `operation_id`. False if there is none, or it
    /// already finished or was cancelled.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.active.remove(operation_id) {
            Some((_, process)) => {
                process.cancel.cancel();
                debug!(operation_id, "worker cancel requested");
                true
            }
            None => false,
        }
    }

    /// Like [`cancel`](Self::cancel), but only while `operation_id` still
    /// names the worker from spawn `generation`.
    pub fn cancel_generation(&self, operation_id: &str, generation: u64) -> bool {
        match self
            .active
            .remove_if(operation_id, |_, p| p.generation == generation)
        {
            Some((_, process)) => {
                process.cancel.cancel();
                debug!(operation_id, generation, "worker cancel requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, operation_id: &str) -> bool {
        self.active.contains_key(operation_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drop the entry only if it still belongs to this spawn.
    fn release(&self, operation_id: &str, generation: u64) -> bool {
        self.active
            .remove_if(operation_id, |_, p| p.generation == generation)
            .is_some()
    }
}

async fn write_payload(child: &mut Child, payload: &str) -> std::io::Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("worker stdin unavailable"))?;
    stdin.write_all(payload.trim_end_matches('\n').as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    // Dropping stdin closes it; the worker sees EOF after the request.
    Ok(())
}

async fn supervise<P, L>(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    cancel: &CancellationToken,
    mut on_progress: P,
    mut on_log: L,
) -> Completion
where
    P: FnMut(String),
    L: FnMut(String),
{
    // Lines are read as bytes; a line that is not UTF-8 is passed on lossily
    // and the stream keeps going.
    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
    let (mut out_open, mut err_open) = (true, true);

    let status: Option<std::io::Result<ExitStatus>> = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            read = out.read_until(b'\n', &mut out_buf), if out_open => match read {
                Ok(0) => {
                    // bytes from an interrupted read may still be buffered
                    if !out_buf.is_empty() {
                        on_progress(take_line(&mut out_buf));
                    }
                    out_open = false;
                }
                Ok(_) => on_progress(take_line(&mut out_buf)),
                Err(e) => {
                    warn!(error = %e, "worker stdout unreadable");
                    out_open = false;
                }
            },
            read = err.read_until(b'\n', &mut err_buf), if err_open => match read {
                Ok(0) if !err_buf.is_empty() => {
                    on_log(take_line(&mut err_buf));
                    err_open = false;
                }
                Ok(0) | Err(_) => err_open = false,
                Ok(_) => on_log(take_line(&mut err_buf)),
            },
            status = child.wait(), if !out_open && !err_open => break Some(status),
        }
    };

    match status {
        None => {
            drop(out);
            drop(err);
            if let Err(e) = child.kill().await {
                debug!(error = %e, "worker already gone");
            }
            Completion::cancelled()
        }
        Some(Ok(status)) => exit_completion(status),
        Some(Err(e)) => Completion::failure(format!("failed to wait for worker: {e}")),
    }
}

/// Drain `buf` as one line without its terminator.
fn take_line(buf: &mut Vec<u8>) -> String {
    let mut end = buf.len();
    if buf[..end].ends_with(b"\n") {
        end -= 1;
    }
    if buf[..end].ends_with(b"\r") {
        end -= 1;
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    line
}

fn exit_completion(status: ExitStatus) -> Completion {
    if status.success() {
        return Completion::success();
    }
    match status.code() {
        Some(code) => Completion::failure(format!("worker exited with code {code}")),
        None => Completion::failure("worker terminated by signal"),
    }
}
