//! Process sessions: one interactive child process attached to a PTY.
//!
//! The child runs `<shell> -lc <command>` in a fixed working directory. The
//! blocking PTY calls (reads, writes, waiting for exit) each live on their
//! own `spawn_blocking` thread and talk to the async side over channels:
//!
//! - input: [`ProcessSession::write`] enqueues bytes, a writer thread drains
//!   them into the PTY master in FIFO order.
//! - output: a reader thread pushes every chunk read from the master into
//!   [`ProcessOutput`]; the channel closes at EOF.
//! - exit: a waiter thread reaps the child once and publishes the status on a
//!   watch channel, so every caller of [`ProcessSession::exited`] sees the
//!   same single exit.
//!
//! Termination is a hangup first. A child that ignores it gets SIGKILL on its
//! whole process group after [`HANGUP_GRACE`], which also releases the PTY so
//! the blocking reader and waiter return.

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 8192;
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// How long a hung-up child gets to exit before it is killed outright.
pub const HANGUP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to open PTY: {0}")]
    OpenPty(String),

    #[error("Failed to spawn {command:?}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("Failed to clone PTY reader: {0}")]
    Reader(String),

    #[error("Failed to take PTY writer: {0}")]
    Writer(String),

    #[error("Process has exited")]
    Exited,

    #[error("Failed to kill process: {0}")]
    Kill(#[source] std::io::Error),
}

/// Initial PTY geometry. Sessions are never resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 30, cols: 120 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Everything needed to start a terminal child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub working_directory: PathBuf,
    pub shell: String,
    pub command: String,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub size: TerminalSize,
}

impl SpawnSpec {
    pub fn new(
        working_directory: impl Into<PathBuf>,
        shell: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            working_directory: working_directory.into(),
            shell: shell.into(),
            command: command.into(),
            env: Vec::new(),
            size: TerminalSize::default(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn build_command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-lc");
        cmd.arg(&self.command);
        cmd.cwd(&self.working_directory);
        cmd.env("TERM", "xterm-color");
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: u32,
    pub success: bool,
}

/// Output side of a process session. Yields chunks in the order the child
/// produced them; `None` once the PTY reaches EOF.
pub struct ProcessOutput {
    rx: mpsc::Receiver<Bytes>,
}

impl ProcessOutput {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

pub struct ProcessSession {
    pid: Option<u32>,
    working_directory: PathBuf,
    input_tx: mpsc::UnboundedSender<Bytes>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    // Held so the PTY stays open for the lifetime of the session.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl ProcessSession {
    /// Spawn the child described by `spec`. Must be called from within a
    /// tokio runtime.
    pub fn spawn(spec: &SpawnSpec) -> Result<(Self, ProcessOutput), ProcessError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(spec.size.into())
            .map_err(|e| ProcessError::OpenPty(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(spec.build_command())
            .map_err(|e| ProcessError::Spawn {
                command: spec.command.clone(),
                reason: e.to_string(),
            })?;

        // Drop slave: we only need the master side
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let mut reader = match pair.master.try_clone_reader() {
            Ok(r) => r,
            Err(e) => {
                let _ = child.kill();
                return Err(ProcessError::Reader(e.to_string()));
            }
        };
        let mut writer = match pair.master.take_writer() {
            Ok(w) => w,
            Err(e) => {
                let _ = child.kill();
                return Err(ProcessError::Writer(e.to_string()));
            }
        };

        // Reader: blocking reads from PTY -> async channel
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx
                            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is how Linux reports a closed PTY
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
        });

        // Writer: async channel -> blocking writes to PTY
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::task::spawn_blocking(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    debug!("PTY write error: {}", e);
                    break;
                }
            }
        });

        // Waiter: reaps the child exactly once
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::task::spawn_blocking(move || {
            let exit = match child.wait() {
                Ok(status) => ProcessExit {
                    code: status.exit_code(),
                    success: status.success(),
                },
                Err(e) => {
                    warn!("Error waiting for child process: {}", e);
                    ProcessExit {
                        code: 1,
                        success: false,
                    }
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

        debug!(pid = ?pid, cwd = %spec.working_directory.display(), "Spawned terminal process");

        Ok((
            Self {
                pid,
                working_directory: spec.working_directory.clone(),
                input_tx,
                killer: Mutex::new(killer),
                exit_rx,
                _master: Mutex::new(pair.master),
            },
            ProcessOutput { rx: output_rx },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// The exit status, if the child has already been reaped.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Queue bytes for the child's input. Never blocks.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), ProcessError> {
        if self.exit_status().is_some() {
            return Err(ProcessError::Exited);
        }
        self.input_tx
            .send(data.into())
            .map_err(|_| ProcessError::Exited)
    }

    /// Wait for the child to exit.
    pub async fn exited(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit {
                code: 1,
                success: false,
            }),
            // The waiter thread never drops the sender without publishing,
            // short of a panic while reaping.
            Err(_) => ProcessExit {
                code: 1,
                success: false,
            },
        };
        exit
    }

    /// Hang up the child, escalating to [`force_kill`](Self::force_kill)
    /// when it is still running after `grace`. Resolves with the exit.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Err(e) = self.kill() {
            debug!(pid = ?self.pid, "Hangup failed: {}", e);
        }
        if let Ok(exit) = tokio::time::timeout(grace, self.exited()).await {
            return exit;
        }
        warn!(pid = ?self.pid, "Process ignored hangup, sending SIGKILL");
        self.force_kill();
        self.exited().await
    }

    /// SIGKILL the child's process group. No-op once the child has exited.
    pub fn force_kill(&self) {
        if self.exit_status().is_some() {
            return;
        }
        self.hard_kill();
    }

    #[cfg(unix)]
    fn hard_kill(&self) {
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
    }

    // The portable-pty killer already terminates outright off Unix
    #[cfg(not(unix))]
    fn hard_kill(&self) {
        if let Err(e) = self.kill() {
            debug!(pid = ?self.pid, "Kill failed: {}", e);
        }
    }

    /// Escalate to SIGKILL from a background task unless the child exits
    /// within [`HANGUP_GRACE`].
    #[cfg(unix)]
    fn escalate_in_background(&self) {
        let (Some(pid), Ok(runtime)) = (self.pid, tokio::runtime::Handle::try_current()) else {
            return;
        };
        let mut exit_rx = self.exit_rx.clone();
        runtime.spawn(async move {
            let exited = matches!(
                tokio::time::timeout(HANGUP_GRACE, exit_rx.wait_for(Option::is_some)).await,
                Ok(Ok(_))
            );
            if !exited && exit_rx.borrow().is_none() {
                warn!(pid, "Dropped process ignored hangup, sending SIGKILL");
                kill_process_group(pid);
            }
        });
    }

    #[cfg(not(unix))]
    fn escalate_in_background(&self) {}

    /// Request termination (a hangup). Safe to call any number of times,
    /// including after the child has exited.
    pub fn kill(&self) -> Result<(), ProcessError> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        let mut killer = match self.killer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match killer.kill() {
            Ok(()) => Ok(()),
            Err(_) if self.exit_status().is_some() => Ok(()),
            Err(e) => Err(ProcessError::Kill(e)),
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.exit_status().is_some() {
            return;
        }
        if let Err(e) = self.kill() {
            debug!(pid = ?self.pid, "Kill on drop failed: {}", e);
        }

        // Nobody waits on the exit anymore
        self.escalate_in_background();
    }
}

/// portable-pty starts the child in its own session, so its pid is also the
/// process group id.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let pgid = match i32::try_from(pid) {
        Ok(pgid) if pgid > 0 => pgid,
        _ => {
            warn!(pid, "Cannot signal process group");
            return;
        }
    };
    // SAFETY: kill(2) only delivers a signal; no memory is shared.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, "SIGKILL failed: {}", std::io::Error::last_os_error());
    }
}
