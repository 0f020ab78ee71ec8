//! Daemon configuration and its defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tabmux_core::scrollback::DEFAULT_SCROLLBACK_BYTES;

use crate::daemon::paths;
use crate::daemon::pty::{ShellCommand, TermSize};

/// Live chunks buffered per panel before a slow attachment falls behind
/// and refills from scrollback.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Time a terminated shell gets between SIGHUP and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// Interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Missed heartbeats tolerated before a connection is dropped.
const HEARTBEAT_MISSES: u32 = 3;

pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const DEFAULT_MAX_PANELS_PER_SESSION: usize = 16;

const FALLBACK_SHELL: &str = "/bin/sh";

/// Everything the daemon needs to know at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Program run in every new panel.
    pub shell: String,
    /// Arguments passed to `shell`.
    pub shell_args: Vec<String>,
    /// Directory new shells start in; the daemon's own when unset.
    pub working_dir: Option<PathBuf>,
    pub scrollback_bytes: usize,
    pub queue_capacity: usize,
    /// Size of a panel's terminal until the client resizes it.
    pub default_size: TermSize,
    pub kill_grace: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_sessions: usize,
    pub max_panels_per_session: usize,
    /// Root for persisted layouts.
    pub data_dir: PathBuf,
    /// Keep layouts on disk; otherwise they live only in memory.
    pub persist_layouts: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_args: Vec::new(),
            working_dir: None,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_size: TermSize::default(),
            kill_grace: DEFAULT_KILL_GRACE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_INTERVAL * HEARTBEAT_MISSES,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_panels_per_session: DEFAULT_MAX_PANELS_PER_SESSION,
            data_dir: paths::get_data_dir(),
            persist_layouts: true,
        }
    }
}

impl DaemonConfig {
    /// Set the heartbeat interval; the timeout follows at three missed pings.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = interval * HEARTBEAT_MISSES;
        self
    }

    /// The command spawned for a new panel.
    pub fn shell_command(&self) -> ShellCommand {
        let command = self
            .shell_args
            .iter()
            .fold(ShellCommand::new(&self.shell), |cmd, arg| cmd.arg(arg));
        match &self.working_dir {
            Some(dir) => command.cwd(dir.clone()),
            None => command,
        }
    }
}

/// `TABMUX_SHELL`, then `SHELL`, then `/bin/sh`.
pub fn default_shell() -> String {
    ["TABMUX_SHELL", "SHELL"]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// User id the CLI identifies as: `TABMUX_USER`, then `USER`.
pub fn default_user() -> String {
    ["TABMUX_USER", "USER"]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "default".to_string())
}
