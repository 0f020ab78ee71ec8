//! Client for connecting to the daemon process.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tabmux_core::protocol::{Command, Request, Response, ResponseData, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::daemon::paths;

/// Maximum time to wait for daemon to start up.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between socket connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for communicating with the daemon.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DaemonClient {
    /// Connect to the daemon as `user_id`, starting it if necessary.
    pub async fn connect(user_id: &str) -> Result<Self> {
        let socket_path = paths::get_socket_path();

        let stream = match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                debug!("Connected to existing daemon");
                stream
            }
            Err(_) => {
                info!("Daemon not running, starting...");
                let child = Self::start_daemon()?;
                Self::wait_for_daemon(&socket_path, child).await?
            }
        };

        Self::identify(stream, user_id).await
    }

    /// Connect to an already running daemon. Returns `None` if none is
    /// listening.
    pub async fn connect_existing(user_id: &str) -> Result<Option<Self>> {
        Self::connect_at(&paths::get_socket_path(), user_id).await
    }

    /// Connect to the daemon listening on `socket_path`, without starting one.
    pub async fn connect_at(socket_path: &Path, user_id: &str) -> Result<Option<Self>> {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => Ok(Some(Self::identify(stream, user_id).await?)),
            Err(e) => {
                debug!("No daemon at {:?}: {}", socket_path, e);
                Ok(None)
            }
        }
    }

    async fn identify(stream: UnixStream, user_id: &str) -> Result<Self> {
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };

        let response = client
            .request(Command::Hello {
                user_id: user_id.to_string(),
            })
            .await?;
        match (response.data, response.error) {
            (Some(ResponseData::Welcome { .. }), _) => Ok(client),
            (_, Some(err)) => bail!("Daemon rejected identity {}: {}", user_id, err),
            (other, None) => bail!("Unexpected hello response: {:?}", other),
        }
    }

    /// Start the daemon as a background process.
    ///
    /// Returns the child process handle so we can detect early crashes.
    fn start_daemon() -> Result<std::process::Child> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().context("Failed to get current executable path")?;

        // process_group(0) keeps the daemon alive when the CLI's terminal
        // closes and sends SIGHUP to its process group.
        let child = std::process::Command::new(exe)
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("Failed to spawn daemon process")?;

        Ok(child)
    }

    /// Wait for the daemon socket to become available.
    ///
    /// Checks if the daemon process crashes early to provide a faster error
    /// instead of waiting for the full timeout.
    async fn wait_for_daemon(
        socket_path: &Path,
        mut child: std::process::Child,
    ) -> Result<UnixStream> {
        let start = std::time::Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    bail!(
                        "Daemon exited immediately with status: {} (run 'tabmux daemon' directly to diagnose)",
                        status
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Error checking daemon status: {}", e);
                }
            }

            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    info!("Connected to daemon after {:?}", start.elapsed());
                    return Ok(stream);
                }
                Err(_) => {
                    if start.elapsed() > DAEMON_STARTUP_TIMEOUT {
                        bail!("Daemon failed to start within {:?}", DAEMON_STARTUP_TIMEOUT);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Send a command and wait for its response.
    pub async fn request(&mut self, command: Command) -> Result<Response> {
        self.request_with_timeout(command, REQUEST_TIMEOUT).await
    }

    /// Send a command and wait for its response with a custom timeout.
    ///
    /// Pushed messages (pings, panel output) arriving in between are
    /// skipped; control clients never attach.
    pub async fn request_with_timeout(
        &mut self,
        command: Command,
        timeout_duration: Duration,
    ) -> Result<Response> {
        let request = Request {
            id: Uuid::new_v4().to_string(),
            command,
        };
        let request_json =
            serde_json::to_string(&request).context("Failed to serialize request")?;
        debug!("Sending: {}", request_json);

        self.writer
            .write_all(request_json.as_bytes())
            .await
            .context("Failed to write request")?;
        self.writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        self.writer.flush().await.context("Failed to flush")?;

        timeout(timeout_duration, self.read_response(&request.id))
            .await
            .context("Request timed out")?
    }

    async fn read_response(&mut self, request_id: &str) -> Result<Response> {
        loop {
            let mut line = String::new();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .context("Failed to read response")?;
            if bytes_read == 0 {
                bail!("Daemon closed connection unexpectedly");
            }

            let message: ServerMessage =
                serde_json::from_str(&line).context("Failed to parse daemon message")?;
            match message {
                ServerMessage::Response(response) if response.id == request_id => {
                    debug!("Received: {}", line.trim());
                    return Ok(response);
                }
                other => trace!("Skipping pushed message: {:?}", other),
            }
        }
    }
}
