//! Process adapter.
//!
//! Spawns the process behind a session: an interactive shell on a
//! pseudo-terminal, or a command on plain pipes whose stdout and stderr are
//! captured separately. The adapter exposes the output as a channel of
//! chunks, takes input through an ordered queue, and reports the exit status
//! exactly once.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::resource::{rlim_t, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{Geometry, OutputOrigin, SessionKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use super::SessionError;
use crate::config::ResourceLimits;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the readers and the output pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// How long to wait for a process after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// A chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Stream the bytes were read from. Pseudo-terminal output is always stdout.
    pub origin: OutputOrigin,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

/// Exit status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Signal number, when the process was killed by a signal.
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// What to run for a session.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Pseudo-terminal for shells, pipes for execution logs.
    pub kind: SessionKind,
    /// Program to execute.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Resource limits applied to the process.
    pub limits: ResourceLimits,
}

/// Maps configured limits to rlimit resources and values.
fn rlimits(limits: &ResourceLimits) -> Vec<(Resource, rlim_t)> {
    const MIB: u64 = 1024 * 1024;
    [
        (Resource::RLIMIT_CPU, limits.cpu_secs),
        (Resource::RLIMIT_AS, limits.memory_mb.map(|mb| mb.saturating_mul(MIB))),
        (Resource::RLIMIT_NPROC, limits.max_processes),
        (Resource::RLIMIT_FSIZE, limits.max_file_mb.map(|mb| mb.saturating_mul(MIB))),
    ]
    .into_iter()
    .filter_map(|(resource, value)| value.map(|v| (resource, v as rlim_t)))
    .collect()
}

/// Applies limits to an already running process.
///
/// Pseudo-terminal children are spawned without a pre-exec hook, so their
/// limits are set from the outside right after the spawn.
#[cfg(target_os = "linux")]
fn apply_rlimits(pid: u32, limits: &[(Resource, rlim_t)]) -> Result<(), SessionError> {
    for &(resource, value) in limits {
        let limit = nix::libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        // SAFETY: `limit` outlives the call and the old-limit pointer may be null.
        let rc = unsafe {
            nix::libc::prlimit(pid as nix::libc::pid_t, resource as _, &limit, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(SessionError::SpawnFailed(format!(
                "cannot apply {:?}: {}",
                resource,
                Errno::last()
            )));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_rlimits(pid: u32, limits: &[(Resource, rlim_t)]) -> Result<(), SessionError> {
    if !limits.is_empty() {
        tracing::warn!(pid, "Resource limits for terminal sessions need Linux, skipping");
    }
    Ok(())
}

/// Creates the ordered input queue of a process.
///
/// The queue exists before the process does, so input sent while the
/// session is still starting is delivered once it runs.
pub fn input_channel(capacity: usize) -> (InputSink, InputSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (InputSink { tx }, InputSource { rx })
}

/// Writing half of a process input queue.
#[derive(Debug, Clone)]
pub struct InputSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InputSink {
    /// Queues bytes for the process stdin without waiting.
    ///
    /// A process that does not read its input fills the queue; further
    /// writes are dropped rather than stalling the caller. Writing after the
    /// process exited is expected under a race with exit and is only logged.
    /// Returns whether the bytes were queued.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        match self.tx.try_send(bytes) {
            Ok(()) => true,
            Err(TrySendError::Full(bytes)) => {
                tracing::warn!(len = bytes.len(), "Input queue full, dropping input");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Dropping input for a process that already exited");
                false
            }
        }
    }
}

/// Reading half of a process input queue, consumed by the writer task.
#[derive(Debug)]
pub struct InputSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

/// A freshly spawned process.
pub struct SpawnedProcess {
    /// Control handle kept by the session.
    pub handle: ProcessHandle,
    /// Output chunks in production order. Closed when all output streams end.
    pub output: mpsc::Receiver<OutputChunk>,
    /// Resolves once, when the process exits.
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// Control handle for a running process.
pub struct ProcessHandle {
    kind: SessionKind,
    pid: Option<u32>,
    master: Option<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Option<Mutex<Box<dyn ChildKiller + Send + Sync>>>,
    exited: watch::Receiver<Option<ProcessExit>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Spawns a process for a session.
///
/// Must be called from within a Tokio runtime.
pub fn spawn(
    spec: &ProcessSpec,
    geometry: Geometry,
    input: InputSource,
) -> Result<SpawnedProcess, SessionError> {
    match spec.kind {
        SessionKind::InteractiveShell => spawn_pty(spec, geometry, input),
        SessionKind::ExecutionLog => spawn_piped(spec, input),
    }
}

fn spawn_pty(
    spec: &ProcessSpec,
    geometry: Geometry,
    input: InputSource,
) -> Result<SpawnedProcess, SessionError> {
    let pair = native_pty_system()
        .openpty(pty_size(geometry))
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(ref dir) = spec.cwd {
        cmd.cwd(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    // The master only sees EOF once every slave handle is closed.
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();

    let limits = rlimits(&spec.limits);
    if let (Some(pid), false) = (pid, limits.is_empty()) {
        if let Err(e) = apply_rlimits(pid, &limits) {
            let _ = child.kill();
            return Err(e);
        }
    }

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(None);

    // Blocking PTY I/O runs on dedicated threads so a process that never
    // closes its terminal cannot hold up runtime shutdown.
    spawn_thread("pty-reader", move || pty_read_loop(reader, output_tx))?;
    spawn_thread("pty-writer", move || pty_write_loop(writer, input))?;
    spawn_thread("pty-waiter", move || {
        let exit = wait_pty_child(child);
        let _ = exited_tx.send(Some(exit));
        let _ = exit_tx.send(exit);
    })?;

    tracing::debug!(pid = ?pid, program = %spec.program, "Spawned PTY process");

    Ok(SpawnedProcess {
        handle: ProcessHandle {
            kind: spec.kind,
            pid,
            master: Some(Mutex::new(pair.master)),
            killer: Some(Mutex::new(killer)),
            exited: exited_rx,
        },
        output: output_rx,
        exit: exit_rx,
    })
}

fn spawn_piped(spec: &ProcessSpec, input: InputSource) -> Result<SpawnedProcess, SessionError> {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(ref dir) = spec.cwd {
        cmd.current_dir(dir);
    }

    let limits = rlimits(&spec.limits);
    if !limits.is_empty() {
        // SAFETY: the hook only issues setrlimit calls, which are
        // async-signal-safe, and allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                for &(resource, value) in &limits {
                    setrlimit(resource, value, value)?;
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", spec.program, e)))?;
    let pid = child.id();

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pipe_read_loop(stdout, OutputOrigin::Stdout, output_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pipe_read_loop(stderr, OutputOrigin::Stderr, output_tx));
    }

    if let Some(mut stdin) = child.stdin.take() {
        let mut input = input;
        tokio::spawn(async move {
            while let Some(bytes) = input.rx.recv().await {
                let result = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Process stdin closed");
                    break;
                }
            }
        });
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(None);
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => ProcessExit::from_status(status),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for process");
                ProcessExit::default()
            }
        };
        let _ = exited_tx.send(Some(exit));
        let _ = exit_tx.send(exit);
    });

    tracing::debug!(pid = ?pid, program = %spec.program, "Spawned piped process");

    Ok(SpawnedProcess {
        handle: ProcessHandle {
            kind: spec.kind,
            pid,
            master: None,
            killer: None,
            exited: exited_rx,
        },
        output: output_rx,
        exit: exit_rx,
    })
}

/// Reaps a pseudo-terminal child and reports how it ended.
///
/// The pty crate only exposes a signal's description, so the status is
/// collected with waitpid to keep the signal number.
fn wait_pty_child(mut child: Box<dyn Child + Send + Sync>) -> ProcessExit {
    if let Some(pid) = child.process_id() {
        loop {
            match waitpid(Pid::from_raw(pid as i32), None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    return ProcessExit {
                        code: Some(code),
                        signal: None,
                    }
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return ProcessExit {
                        code: None,
                        signal: Some(signal as i32),
                    }
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::debug!(pid, error = %e, "waitpid failed, falling back");
                    break;
                }
            }
        }
    }

    match child.wait() {
        Ok(status) => ProcessExit {
            code: Some(status.exit_code() as i32),
            signal: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to wait for PTY child");
            ProcessExit::default()
        }
    }
}

fn spawn_thread<F>(name: &str, f: F) -> Result<(), SessionError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| SessionError::SpawnFailed(format!("failed to start {} thread: {}", name, e)))
}

fn pty_read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<OutputChunk>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    origin: OutputOrigin::Stdout,
                    bytes: buffer[..n].to_vec(),
                };
                if tx.blocking_send(chunk).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side is gone.
            Err(e) => {
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

fn pty_write_loop(mut writer: Box<dyn Write + Send>, mut input: InputSource) {
    while let Some(bytes) = input.rx.blocking_recv() {
        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "PTY input closed");
            break;
        }
    }
}

async fn pipe_read_loop<R>(mut reader: R, origin: OutputOrigin, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    origin,
                    bytes: buffer[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, ?origin, "Pipe read failed");
                break;
            }
        }
    }
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl ProcessHandle {
    /// Returns the process ID, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the exit status if the process already exited.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exited.borrow()
    }

    /// Resizes the terminal. Processes on pipes ignore it.
    pub fn resize(&self, geometry: Geometry) -> Result<(), SessionError> {
        let Some(ref master) = self.master else {
            return Ok(());
        };
        let master = master
            .lock()
            .map_err(|_| SessionError::Invariant("PTY master lock poisoned".to_string()))?;
        master
            .resize(pty_size(geometry))
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))
    }

    /// Waits until the process exits.
    pub async fn wait(&self) -> ProcessExit {
        let mut exited = self.exited.clone();
        let exit = match exited.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_default(),
            // The waiter is gone, so there is nothing left to wait for.
            Err(_) => ProcessExit::default(),
        };
        exit
    }

    /// Terminates the process.
    ///
    /// Shells get SIGHUP and commands SIGTERM, sent to the whole process
    /// group. If the process is still alive after `grace`, it is killed.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.exit_status() {
            return exit;
        }

        let soft = match self.kind {
            SessionKind::InteractiveShell => Signal::SIGHUP,
            SessionKind::ExecutionLog => Signal::SIGTERM,
        };
        self.signal(soft);

        if let Ok(exit) = tokio::time::timeout(grace, self.wait()).await {
            return exit;
        }

        tracing::warn!(
            pid = ?self.pid,
            grace_secs = grace.as_secs_f32(),
            "Process ignored termination signal, killing"
        );
        self.signal(Signal::SIGKILL);

        match tokio::time::timeout(KILL_WAIT, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::error!(pid = ?self.pid, "Process survived SIGKILL");
                ProcessExit::default()
            }
        }
    }

    fn signal(&self, signal: Signal) {
        if self.exit_status().is_some() {
            return;
        }

        if let Some(pid) = self.pid {
            match killpg(Pid::from_raw(pid as i32), signal) {
                Ok(()) => {
                    tracing::debug!(pid, ?signal, "Signalled process group");
                    return;
                }
                Err(nix::errno::Errno::ESRCH) => return,
                Err(e) => {
                    tracing::debug!(pid, ?signal, error = %e, "killpg failed");
                }
            }
        }

        if signal == Signal::SIGKILL {
            if let Some(ref killer) = self.killer {
                if let Ok(mut killer) = killer.lock() {
                    if let Err(e) = killer.kill() {
                        tracing::debug!(error = %e, "Child kill failed");
                    }
                }
            }
        }
    }
}
