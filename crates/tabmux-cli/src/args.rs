//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::daemon::config::DaemonConfig;

/// Persistent terminal sessions for browser tabs.
///
/// The daemon keeps shells alive while clients come and go, and replays
/// exactly the output a reconnecting client missed. The commands below
/// manage the daemon and inspect sessions from the command line.
#[derive(Debug, Parser)]
#[command(name = "tabmux", version)]
pub struct Cli {
    /// User to act as [default: $TABMUX_USER or $USER]
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the daemon process (usually auto-started)
    #[command(after_help = "\
Examples:
  tabmux daemon                           # Defaults, shell from $TABMUX_SHELL or $SHELL
  tabmux daemon --shell /bin/bash         # Run bash in every panel
  tabmux daemon --scrollback-bytes 1048576  # Keep 1 MiB of history per panel
  RUST_LOG=debug tabmux daemon            # Verbose logging")]
    Daemon(DaemonArgs),

    /// Stop the daemon process and every shell it runs
    Stop,

    /// List your sessions and their panels
    Sessions,

    /// Create an empty session
    #[command(after_help = "\
Examples:
  tabmux new-session                      # Unnamed session
  tabmux new-session --name work          # Named session")]
    NewSession(NewSessionArgs),

    /// Destroy a session and terminate its shells
    KillSession(SessionArgs),

    /// Print the stored panel layout of a session
    Layout(SessionArgs),

    /// Show an end-to-end usage example
    Examples,
}

#[derive(Debug, clap::Args)]
pub struct DaemonArgs {
    /// Program to run in every new panel
    #[arg(long, value_name = "PATH")]
    pub shell: Option<String>,

    /// Output history kept per panel, in bytes
    #[arg(long, value_name = "BYTES")]
    pub scrollback_bytes: Option<usize>,

    /// Live chunks buffered per panel before slow attachments refill from scrollback
    #[arg(long, value_name = "COUNT")]
    pub queue_capacity: Option<usize>,

    /// Milliseconds between SIGHUP and SIGKILL when ending a shell
    #[arg(long, value_name = "MS")]
    pub kill_grace_ms: Option<u64>,

    /// Seconds between heartbeat pings (three missed pings drop a client)
    #[arg(long, value_name = "SECS")]
    pub heartbeat_secs: Option<u64>,

    /// Directory new shells start in [default: the daemon's directory]
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Keep layouts in memory only instead of under $TABMUX_DATA_DIR
    #[arg(long)]
    pub no_persist: bool,
}

impl DaemonArgs {
    /// Apply the flags on top of the defaults.
    pub fn into_config(self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        if let Some(shell) = self.shell {
            config.shell = shell;
        }
        if let Some(bytes) = self.scrollback_bytes {
            config.scrollback_bytes = bytes.max(1);
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity.max(1);
        }
        if let Some(ms) = self.kill_grace_ms {
            config.kill_grace = Duration::from_millis(ms);
        }
        if let Some(secs) = self.heartbeat_secs {
            config = config.with_heartbeat(Duration::from_secs(secs.max(1)));
        }
        config.working_dir = self.cwd;
        config.persist_layouts = !self.no_persist;
        config
    }
}

#[derive(Debug, clap::Args)]
pub struct NewSessionArgs {
    /// Give this session a human-readable name
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct SessionArgs {
    /// Session ID (see `tabmux sessions`)
    pub session_id: String,
}

/// End-to-end example text for the `examples` command.
pub const EXAMPLES_TEXT: &str = r#"End-to-end example: a session that outlives its browser tab

# 1. Create a session (the daemon starts on demand)
tabmux new-session --name work

# 2. Find its ID
tabmux sessions

# 3. A browser client now connects, sends
#      {"id":"1","command":{"action":"hello","user_id":"alice"}}
#    creates panels with create_panel, attaches with attach_panel and acks
#    the output it renders. Closing the tab only detaches; the shells keep
#    running.

# 4. Inspect the layout the client left behind
tabmux layout <session-id>

# 5. On reconnect the client sends attach_panel with its last ack and
#    receives only the output it missed.

# 6. Clean up
tabmux kill-session <session-id>
tabmux stop
"#;

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_daemon_flags_override_defaults() {
        let cli = Cli::parse_from([
            "tabmux",
            "daemon",
            "--shell",
            "/bin/bash",
            "--scrollback-bytes",
            "4096",
            "--kill-grace-ms",
            "500",
            "--heartbeat-secs",
            "5",
        ]);

        match cli.command {
            Commands::Daemon(args) => {
                let config = args.into_config();
                assert_eq!(config.shell, "/bin/bash");
                assert_eq!(config.scrollback_bytes, 4096);
                assert_eq!(config.kill_grace, Duration::from_millis(500));
                assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
                assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
                assert_eq!(config.queue_capacity, 1024);
                assert!(config.persist_layouts);
            }
            _ => panic!("Expected daemon command"),
        }
    }

    #[test]
    fn test_daemon_ephemeral_flags() {
        let cli = Cli::parse_from(["tabmux", "daemon", "--no-persist", "--cwd", "/srv"]);
        match cli.command {
            Commands::Daemon(args) => {
                let config = args.into_config();
                assert!(!config.persist_layouts);
                assert_eq!(config.working_dir, Some(PathBuf::from("/srv")));
            }
            _ => panic!("Expected daemon command"),
        }
    }

    #[test]
    fn test_global_user_flag() {
        let cli = Cli::parse_from(["tabmux", "kill-session", "abc", "--user", "alice"]);

        assert_eq!(cli.user.as_deref(), Some("alice"));
        match cli.command {
            Commands::KillSession(args) => assert_eq!(args.session_id, "abc"),
            _ => panic!("Expected kill-session command"),
        }
    }

    #[test]
    fn test_new_session_name_is_optional() {
        let cli = Cli::parse_from(["tabmux", "new-session"]);
        assert!(matches!(cli.command, Commands::NewSession(args) if args.name.is_none()));
    }
}
