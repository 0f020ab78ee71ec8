//! PTY process handles using portable-pty.

use std::fmt::Display;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Errors raised by PTY processes.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },
    #[error("process has terminated")]
    ProcessTerminated,
}

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// The command line a panel's PTY runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    fn display(&self) -> String {
        self.argv().join(" ")
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How often exit status is polled while waiting for a process.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Work for the writer thread. Input and resizes share one queue so they
/// reach the PTY in the order they were issued.
enum PtyCommand {
    Write(Vec<u8>),
    /// Replies whether the terminal took the new size.
    Resize(TermSize, oneshot::Sender<bool>),
}

/// A live child process on a pseudo-terminal.
///
/// Output is read on a background thread and handed out once through
/// [`PtyHandle::take_output`]; whoever takes it is the only consumer.
pub struct PtyHandle {
    command_tx: mpsc::Sender<PtyCommand>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    /// Set once the process exited or its terminal hung up.
    terminated: Arc<AtomicBool>,
    exit_code: Mutex<Option<u32>>,
    /// Updated by the writer thread once a resize is applied.
    size: Arc<Mutex<TermSize>>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
    writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl PtyHandle {
    /// Spawn a command on a new PTY and start its I/O threads.
    pub fn spawn(command: &ShellCommand, size: TermSize) -> Result<Self, PtyError> {
        let spawn_err = |reason: String| PtyError::Spawn {
            command: command.display(),
            reason,
        };

        if command.program.is_empty() {
            return Err(spawn_err("command cannot be empty".to_string()));
        }

        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| spawn_err(format!("failed to open PTY: {}", e)))?;

        let child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| spawn_err(e.to_string()))?;
        // Our copy of the slave must close or the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_err(format!("failed to clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_err(format!("failed to take PTY writer: {}", e)))?;

        let pid = child.process_id();
        let terminated = Arc::new(AtomicBool::new(false));

        let (command_tx, command_rx) = mpsc::channel::<PtyCommand>(64);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);

        let reader_terminated = terminated.clone();
        let reader_thread = std::thread::spawn(move || {
            Self::reader_loop(reader, output_tx, reader_terminated);
        });

        let master = pair.master;
        let size = Arc::new(Mutex::new(size));
        let writer_size = size.clone();
        let writer_terminated = terminated.clone();
        let writer_thread = std::thread::spawn(move || {
            Self::writer_loop(writer, master, command_rx, writer_size, writer_terminated);
        });

        debug!("Spawned '{}' with pid {:?}", command.display(), pid);

        Ok(Self {
            command_tx,
            output_rx: Mutex::new(Some(output_rx)),
            child: Mutex::new(child),
            pid,
            terminated,
            exit_code: Mutex::new(None),
            size,
            reader_thread: Some(reader_thread),
            writer_thread: Some(writer_thread),
        })
    }

    /// Take the output stream. Returns `None` after the first call.
    ///
    /// The stream ends (`recv` yields `None`) when the PTY reaches EOF.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size, as last applied.
    pub fn size(&self) -> TermSize {
        *self.size.lock()
    }

    /// Send bytes to the process's terminal input.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.is_terminated() {
            return Err(PtyError::ProcessTerminated);
        }
        self.command_tx
            .send(PtyCommand::Write(data.to_vec()))
            .await
            .map_err(|_| PtyError::ProcessTerminated)
    }

    /// Resize the terminal (the child gets SIGWINCH).
    ///
    /// The resize is queued behind pending input. If the OS rejects it the
    /// failure is logged and the terminal keeps its previous size.
    pub async fn resize(&self, size: TermSize) -> Result<(), PtyError> {
        if self.is_terminated() {
            return Err(PtyError::ProcessTerminated);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(PtyCommand::Resize(size, done_tx))
            .await
            .map_err(|_| PtyError::ProcessTerminated)?;
        // A dropped reply means the writer thread is gone.
        done_rx.await.map_err(|_| PtyError::ProcessTerminated)?;
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst) || self.try_reap().is_some()
    }

    /// Collect the exit status if the child has exited, without blocking.
    fn try_reap(&self) -> Option<u32> {
        if let Some(code) = *self.exit_code.lock() {
            return Some(code);
        }
        let status = match self.child.lock().try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                debug!("Failed to poll child status: {}", e);
                return None;
            }
        };
        let code = status.exit_code();
        *self.exit_code.lock() = Some(code);
        self.terminated.store(true, Ordering::SeqCst);
        Some(code)
    }

    /// Exit code, if the process has exited.
    #[cfg(test)]
    pub fn exit_code(&self) -> Option<u32> {
        self.try_reap()
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<u32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(code) = self.try_reap() {
                return Some(code);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Kill the process immediately.
    pub fn kill(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let mut child = self.child.lock();
        if let Err(e) = child.kill() {
            debug!(
                "Failed to kill child process (may have already exited): {}",
                e
            );
        }
        // Collect exit status to prevent zombie process accumulation.
        if let Err(e) = child.try_wait() {
            debug!("Failed to collect child exit status: {}", e);
        }
    }

    /// Ask the process to hang up, then force-kill it after `grace`.
    pub async fn terminate(&self, grace: Duration) {
        if self.try_reap().is_some() {
            return;
        }

        if let Some(pid) = self.pid {
            // SAFETY: kill(2) with a pid we spawned and a valid signal number
            // has no memory-safety requirements. The status check above
            // narrows the window for signalling a recycled pid.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
            if rc != 0 {
                debug!(
                    "SIGHUP to pid {} failed: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }

        if self.wait_exit(grace).await.is_none() {
            warn!(
                "Process {:?} still running after {:?}, killing",
                self.pid, grace
            );
            self.kill();
        }
    }

    /// Reader loop running in a background thread.
    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        output_tx: mpsc::Sender<Vec<u8>>,
        terminated: Arc<AtomicBool>,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    // Use blocking send since we're in a thread
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        debug!("PTY output channel closed");
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    // Linux reports EIO once the slave side is gone.
                    debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }
        terminated.store(true, Ordering::SeqCst);
    }

    /// Writer loop running in a background thread. Owns the master so that
    /// resizes are applied in order with input.
    fn writer_loop(
        mut writer: Box<dyn Write + Send>,
        master: Box<dyn MasterPty + Send>,
        mut command_rx: mpsc::Receiver<PtyCommand>,
        size: Arc<Mutex<TermSize>>,
        terminated: Arc<AtomicBool>,
    ) {
        while let Some(command) = command_rx.blocking_recv() {
            match command {
                PtyCommand::Write(data) => {
                    if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                        error!("PTY write error: {}", e);
                        terminated.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                PtyCommand::Resize(requested, done) => {
                    let outcome = master.resize(requested.into());
                    let applied = record_resize(&size, requested, outcome);
                    let _ = done.send(applied);
                }
            }
        }
        debug!("PTY writer exiting");
    }
}

/// Store `requested` as the terminal size if the resize went through.
fn record_resize<E: Display>(
    current: &Mutex<TermSize>,
    requested: TermSize,
    outcome: Result<(), E>,
) -> bool {
    match outcome {
        Ok(()) => {
            *current.lock() = requested;
            true
        }
        Err(e) => {
            warn!(
                "Failed to resize PTY to {}x{}: {}",
                requested.cols, requested.rows, e
            );
            false
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        // Kill the child so no process outlives its handle.
        if self.try_reap().is_none() {
            self.kill();
        }

        // The threads are not joined: the reader may be blocked in read()
        // until the PTY closes, and the writer exits once command_tx drops.
        if let Some(ref handle) = self.reader_thread {
            if !handle.is_finished() {
                debug!("PTY reader thread still running on drop, will terminate on PTY close");
            }
        }
        if let Some(ref handle) = self.writer_thread {
            if !handle.is_finished() {
                debug!("PTY writer thread still running on drop, will terminate on channel close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drain output until `needle` shows up or the timeout expires.
    async fn read_until(rx: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
        let mut seen = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = rx.recv().await {
                seen.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&seen).contains(needle) {
                    break;
                }
            }
        })
        .await;
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[tokio::test]
    async fn test_spawn_and_read_output() {
        let cmd = ShellCommand::new("sh").arg("-c").arg("echo hello");
        let handle = PtyHandle::spawn(&cmd, TermSize::default()).expect("spawn sh");
        let mut output = handle.take_output().expect("output stream");

        let text = read_until(&mut output, "hello").await;
        assert!(text.contains("hello"), "got {:?}", text);
        assert!(handle.take_output().is_none(), "output can only be taken once");
    }

    #[tokio::test]
    async fn test_write_is_echoed() {
        let handle = PtyHandle::spawn(&ShellCommand::new("cat"), TermSize::default())
            .expect("spawn cat");
        let mut output = handle.take_output().expect("output stream");

        handle.write(b"test input\n").await.expect("write");
        let text = read_until(&mut output, "test input").await;
        assert!(text.contains("test input"), "got {:?}", text);

        handle.kill();
    }

    #[tokio::test]
    async fn test_output_ends_and_exit_code_reported() {
        let cmd = ShellCommand::new("sh").arg("-c").arg("exit 3");
        let handle = PtyHandle::spawn(&cmd, TermSize::default()).expect("spawn");
        let mut output = handle.take_output().expect("output stream");

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream should end at EOF");

        let code = handle.wait_exit(Duration::from_secs(5)).await;
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let cmd = ShellCommand::new("sh").arg("-c").arg("exit 0");
        let handle = PtyHandle::spawn(&cmd, TermSize::default()).expect("spawn");
        let _output = handle.take_output();

        assert!(handle.wait_exit(Duration::from_secs(5)).await.is_some());
        let err = handle.write(b"echo too late\n").await.unwrap_err();
        assert!(matches!(err, PtyError::ProcessTerminated));
    }

    #[tokio::test]
    async fn test_resize_updates_size() {
        let handle = PtyHandle::spawn(&ShellCommand::new("sh"), TermSize { cols: 80, rows: 24 })
            .expect("spawn sh");
        let _output = handle.take_output();

        handle
            .resize(TermSize {
                cols: 120,
                rows: 40,
            })
            .await
            .expect("resize");
        assert_eq!(
            handle.size(),
            TermSize {
                cols: 120,
                rows: 40
            }
        );
        handle.kill();
    }

    #[test]
    fn test_failed_resize_keeps_previous_size() {
        let current = Mutex::new(TermSize { cols: 80, rows: 24 });
        let requested = TermSize { cols: 200, rows: 60 };

        assert!(!record_resize(&current, requested, Err("ioctl failed")));
        assert_eq!(*current.lock(), TermSize { cols: 80, rows: 24 });

        assert!(record_resize(&current, requested, Ok::<(), &str>(())));
        assert_eq!(*current.lock(), requested);
    }

    #[tokio::test]
    async fn test_resize_reaches_child() {
        let handle = PtyHandle::spawn(&ShellCommand::new("sh"), TermSize::default())
            .expect("spawn sh");
        let mut output = handle.take_output().expect("output stream");

        handle
            .resize(TermSize { cols: 100, rows: 30 })
            .await
            .expect("resize");
        handle.write(b"stty size\n").await.expect("write");

        let text = read_until(&mut output, "30 100").await;
        assert!(text.contains("30 100"), "got {:?}", text);
        handle.kill();
    }

    #[tokio::test]
    async fn test_terminate_ends_shell() {
        let handle = PtyHandle::spawn(&ShellCommand::new("sh"), TermSize::default())
            .expect("spawn sh");
        let _output = handle.take_output();

        let finished =
            tokio::time::timeout(Duration::from_secs(5), handle.terminate(Duration::from_secs(1)))
                .await;
        assert!(finished.is_ok(), "terminate should not hang");
        assert!(handle.wait_exit(Duration::from_secs(2)).await.is_some());
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let cmd = ShellCommand::new("/nonexistent/tabmux-shell");
        match PtyHandle::spawn(&cmd, TermSize::default()) {
            Err(PtyError::Spawn { command, .. }) => {
                assert_eq!(command, "/nonexistent/tabmux-shell")
            }
            Err(other) => panic!("expected spawn error, got {}", other),
            Ok(_) => panic!("spawning a missing program should fail"),
        }
    }

    #[test]
    fn test_shell_command_argv() {
        let cmd = ShellCommand::new("bash").arg("-l").cwd("/tmp");
        assert_eq!(cmd.argv(), vec!["bash", "-l"]);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
        assert!(cmd.env.iter().any(|(k, _)| k == "TERM"));
    }
}
