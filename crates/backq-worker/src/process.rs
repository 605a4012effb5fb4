//! Child processes launched on behalf of jobs.
//!
//! Children run concurrently with the worker loop and are only ever polled
//! with `try_wait`. Their output is drained into small capped buffers by
//! background tasks so a chatty child never blocks on a full pipe.

use crate::config::ProcessConfig;
use backq_core::{Commandline, ProcessMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Finished-but-unreaped processes tolerated in an arena
pub const ZOMBIE_BUDGET: usize = 1;

const OUTPUT_SETTLE: Duration = Duration::from_millis(100);

/// Everything needed to start a child, built without starting it
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub commandline: Commandline,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub input: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub max_output_bytes: usize,
}

impl LaunchSpec {
    pub fn from_message(message: &ProcessMessage, config: &ProcessConfig) -> Self {
        LaunchSpec {
            commandline: message.commandline.clone(),
            cwd: message.cwd.clone(),
            env: message.env.clone(),
            input: message.input.clone(),
            timeout: config.timeout_for(message.timeout),
            max_output_bytes: config.max_output_bytes,
        }
    }

    fn command(&self) -> io::Result<Command> {
        let mut command = match &self.commandline {
            Commandline::Shell(line) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(line);
                command
            }
            Commandline::Argv(argv) => {
                let (program, args) = argv.split_first().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "empty argument list")
                })?;
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        };

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &self.env {
            command.envs(env);
        }

        command
            .stdin(if self.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }

    /// Start the child and its pipe tasks
    pub fn spawn(self) -> io::Result<ManagedProcess> {
        let mut child = self.command()?.spawn()?;
        let commandline = self.commandline.to_string();

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut drains = Vec::with_capacity(2);

        if let Some(pipe) = child.stdout.take() {
            drains.push(drain(pipe, stdout.clone(), self.max_output_bytes));
        }
        if let Some(pipe) = child.stderr.take() {
            drains.push(drain(pipe, stderr.clone(), self.max_output_bytes));
        }
        if let (Some(mut pipe), Some(input)) = (child.stdin.take(), self.input) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!("Could not write process input: {}", e);
                }
            });
        }

        debug!("Started process {:?}: {}", child.id(), commandline);
        Ok(ManagedProcess {
            child,
            commandline,
            started: Instant::now(),
            timeout: self.timeout,
            stdout,
            stderr,
            drains,
            exit: ExitState::Running,
            timed_out: false,
        })
    }
}

fn drain<R>(mut pipe: R, buffer: Arc<Mutex<Vec<u8>>>, limit: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Keep reading past the cap so the child never blocks on the pipe
                    let mut buffer = buffer.lock();
                    let room = limit.saturating_sub(buffer.len());
                    buffer.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(ExitStatus),
    /// Exit state handed out, or lost to a failed wait
    Collected,
}

/// A launched child process and its captured output
pub struct ManagedProcess {
    child: Child,
    commandline: String,
    started: Instant,
    timeout: Option<Duration>,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    drains: Vec<JoinHandle<()>>,
    exit: ExitState,
    timed_out: bool,
}

impl ManagedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn commandline(&self) -> &str {
        &self.commandline
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    fn poll(&mut self) {
        if self.exit != ExitState::Running {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.exit = ExitState::Exited(status),
            Ok(None) => {}
            Err(e) => {
                warn!("Could not poll process {}: {}", self.commandline, e);
                self.exit = ExitState::Collected;
            }
        }
    }

    /// Non-blocking liveness check
    pub fn is_running(&mut self) -> bool {
        self.poll();
        self.exit == ExitState::Running
    }

    /// Kill the child if it outlived its timeout. Returns whether it did.
    pub fn check_timeout(&mut self) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        if self.timed_out || !self.is_running() || self.started.elapsed() < timeout {
            return false;
        }

        self.timed_out = true;
        if let Err(e) = self.child.start_kill() {
            warn!("Could not kill process {}: {}", self.commandline, e);
        }
        true
    }

    /// The exit status, handed out once after the child finished
    pub fn take_exit(&mut self) -> Option<ExitStatus> {
        self.poll();
        match self.exit {
            ExitState::Exited(status) => {
                self.exit = ExitState::Collected;
                Some(status)
            }
            _ => None,
        }
    }

    /// Wait briefly for the pipe tasks to pick up the last of the output
    pub async fn settle_output(&mut self) {
        for drain in self.drains.drain(..) {
            let _ = tokio::time::timeout(OUTPUT_SETTLE, drain).await;
        }
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.stdout.lock().clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.stderr.lock().clone()
    }

    pub fn clear_output(&self) {
        self.stdout.lock().clear();
        self.stderr.lock().clear();
    }

    #[cfg(unix)]
    fn interrupt(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        // SAFETY: pid belongs to our own child, which has not been waited on yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc != 0 {
            debug!("SIGINT to process {} failed: {}", pid, io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Interrupt the child, escalate to a kill after `grace`, and wait for it
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if self.is_running() {
            self.interrupt();
            if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                self.exit = ExitState::Collected;
                return status;
            }
            warn!("Process {} ignored SIGINT, killing it", self.commandline);
            self.child.start_kill()?;
        }

        let status = self.child.wait().await;
        self.exit = ExitState::Collected;
        status
    }
}

/// Slots of tracked processes with explicit reaping.
///
/// A slot stays occupied until [`ProcessArena::reap`] frees it, finished
/// children included. Inserting always succeeds; the owner is expected to
/// keep [`ProcessArena::finished`] within [`ZOMBIE_BUDGET`] by reaping.
#[derive(Default)]
pub struct ProcessArena {
    slots: Vec<Option<ManagedProcess>>,
    free: Vec<usize>,
}

impl ProcessArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Occupied slots, in slot order
    pub fn occupied(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, process)| process.as_ref().map(|_| slot))
            .collect()
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ManagedProcess> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Tracked children that finished but were not reaped yet
    pub fn finished(&mut self) -> usize {
        self.slots
            .iter_mut()
            .flatten()
            .map(|process| process.is_running())
            .filter(|running| !running)
            .count()
    }

    /// Whether the unreaped finished children fit the zombie budget
    pub fn within_budget(&mut self) -> bool {
        self.finished() <= ZOMBIE_BUDGET
    }

    /// Track a process in the first free slot
    pub fn insert(&mut self, process: ManagedProcess) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(process);
                slot
            }
            None => {
                self.slots.push(Some(process));
                self.slots.len() - 1
            }
        }
    }

    /// Stop tracking a slot and free it for reuse
    pub fn reap(&mut self, slot: usize) -> Option<ManagedProcess> {
        let process = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some(process)
    }
}
