//! Child process execution with console streaming.

use gantry_core::environment::SecretMask;
use gantry_core::publisher::JobPublisher;
use gantry_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output already written by a killed process may take to drain.
const KILLED_OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Child processes started by the current job, so they can be killed from
/// outside the task awaiting them.
#[derive(Default)]
pub struct ProcessRegistry {
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, (String, oneshot::Sender<()>)>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, description: &str) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.running
            .lock()
            .insert(id, (description.to_string(), tx));
        (id, rx)
    }

    fn deregister(&self, id: u64) {
        self.running.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every registered process to terminate. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<(String, oneshot::Sender<()>)> =
            self.running.lock().drain().map(|(_, v)| v).collect();
        let count = drained.len();
        for (description, tx) in drained {
            info!(process = %description, "Killing child process");
            // The receiver is gone once the process has already exited.
            let _ = tx.send(());
        }
        count
    }
}

/// A command ready to run.
pub struct ProcessSpec<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub working_dir: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub secrets: &'a SecretMask,
}

/// Run a command to completion, streaming every output line to the publisher.
///
/// The command leads its own process group; a kill through the registry
/// terminates everything it started, not just the direct child. A non-zero
/// exit status, or termination through the registry, is a [`Error::StepFailed`].
pub async fn run_process(
    spec: ProcessSpec<'_>,
    publisher: Arc<dyn JobPublisher>,
    registry: &ProcessRegistry,
) -> Result<()> {
    let description = if spec.args.is_empty() {
        spec.command.to_string()
    } else {
        format!("{} {}", spec.command, spec.args.join(" "))
    };

    let shown = spec.secrets.mask(&description);

    debug!(command = %shown, dir = %spec.working_dir.display(), "Spawning process");
    let mut command = Command::new(spec.command);
    command
        .args(spec.args)
        .current_dir(spec.working_dir)
        .envs(spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command
        .spawn()
        .map_err(|e| Error::StepFailed(format!("Failed to start '{}': {}", shown, e)))?;
    let pid = child.id();

    let (id, kill_rx) = registry.register(&shown);

    let readers: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|out| tokio::spawn(pipe_lines(out, publisher.clone(), spec.secrets.clone()))),
        child
            .stderr
            .take()
            .map(|err| tokio::spawn(pipe_lines(err, publisher.clone(), spec.secrets.clone()))),
    ]
    .into_iter()
    .flatten()
    .collect();

    let outcome = tokio::select! {
        status = child.wait() => status.map(Some),
        Ok(()) = kill_rx => {
            if let Some(pid) = pid {
                kill_process_group(pid).await;
            }
            if let Err(e) = child.kill().await {
                warn!(command = %shown, error = %e, "Failed to kill process");
            }
            Ok(None)
        }
    };
    registry.deregister(id);

    if matches!(outcome, Ok(None)) {
        // Processes outside the group may still hold the pipes open.
        drain_readers(readers, KILLED_OUTPUT_DRAIN).await;
    } else {
        for task in readers {
            if let Err(e) = task.await {
                warn!(error = %e, "Output reader task failed");
            }
        }
    }

    match outcome {
        Ok(Some(status)) if status.success() => Ok(()),
        Ok(Some(status)) => Err(Error::StepFailed(match status.code() {
            Some(code) => format!("'{}' exited with code {}", shown, code),
            None => format!("'{}' was terminated by a signal", shown),
        })),
        Ok(None) => Err(Error::StepFailed(format!("'{}' was killed", shown))),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Send SIGKILL to every process in the group led by `pid`.
#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => debug!(pgid = pid, "Killed process group"),
        Ok(status) => warn!(pgid = pid, status = %status, "kill exited unsuccessfully"),
        Err(e) => warn!(pgid = pid, error = %e, "Failed to run kill"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

/// Give the output readers `limit` to finish, then abort whatever is left.
async fn drain_readers(readers: Vec<JoinHandle<()>>, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    for mut task in readers {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            debug!("Output reader still open after kill, aborting it");
            task.abort();
        }
    }
}

async fn pipe_lines<R>(reader: R, publisher: Arc<dyn JobPublisher>, secrets: SecretMask)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if secrets.is_empty() => publisher.consume_line(&line),
            Ok(Some(line)) => publisher.consume_line(&secrets.mask(&line)),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}
