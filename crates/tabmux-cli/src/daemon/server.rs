//! Unix socket server for the daemon process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tabmux_core::error::ApiError;
use tabmux_core::protocol::{Command, Request, Response, ResponseData, ServerMessage};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::daemon::config::DaemonConfig;
use crate::daemon::connection::{ConnectionId, ConnectionManager, PendingAttach};
use crate::daemon::layout_store::{FileLayoutStore, LayoutStore, MemoryLayoutStore};
use crate::daemon::paths;
use crate::daemon::session::{PanelId, SessionId, SessionRegistry};

/// Maximum number of concurrent client connections to prevent resource exhaustion.
const MAX_CONNECTIONS: usize = 100;

/// How long to wait for in-flight connections to complete during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages buffered between a connection's producers and its socket writer.
const OUTBOUND_BUFFER: usize = 256;

/// How long a closing connection's writer may keep flushing.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The daemon server that listens for client connections.
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    /// Semaphore to limit concurrent connections and prevent resource exhaustion.
    connection_semaphore: Arc<Semaphore>,
    /// Shutdown signal for graceful termination (allows Drop to run and clean up files).
    shutdown: Arc<Notify>,
}

/// A response, optionally followed by an attachment to start once the
/// response is queued.
struct Reply {
    response: Response,
    then_start: Option<PendingAttach>,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self {
            response,
            then_start: None,
        }
    }
}

/// Shared state handed to every connection handler.
#[derive(Clone)]
struct ServerContext {
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    shutdown: Arc<Notify>,
}

impl DaemonServer {
    /// Bind to the default socket path, persisting layouts under the
    /// configured data directory unless persistence is off.
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        let store: Arc<dyn LayoutStore> = if config.persist_layouts {
            Arc::new(FileLayoutStore::open(&config.data_dir)?)
        } else {
            info!("Layout persistence disabled, keeping layouts in memory");
            Arc::new(MemoryLayoutStore::new())
        };
        Self::bind_to(
            paths::get_socket_path(),
            paths::get_pid_path(),
            config,
            store,
        )
        .await
    }

    /// Create a new daemon server bound to a specific socket path.
    ///
    /// Uses a bind-first approach to avoid TOCTOU race conditions:
    /// 1. Try to bind directly
    /// 2. If socket in use, check PID file to see if daemon is alive
    /// 3. If daemon dead, remove stale socket and retry
    /// 4. If daemon alive, return error
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        config: DaemonConfig,
        store: Arc<dyn LayoutStore>,
    ) -> Result<Self> {
        paths::ensure_socket_dir()?;
        if let Some(parent) = socket_path.parent() {
            paths::ensure_private_dir(parent)?;
        }

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!("Daemon already running (socket: {:?})", socket_path);
                }

                let metadata = std::fs::symlink_metadata(&socket_path)
                    .with_context(|| format!("Failed to inspect socket: {:?}", socket_path))?;
                if metadata.file_type().is_symlink() {
                    anyhow::bail!("Refusing to replace symlink at {:?}", socket_path);
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::FileTypeExt;
                    if !metadata.file_type().is_socket() {
                        anyhow::bail!("Refusing to replace non-socket file at {:?}", socket_path);
                    }
                }

                info!("Removing stale socket from a dead daemon");
                std::fs::remove_file(&socket_path)
                    .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))?;

                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        info!("Daemon listening on {:?}", socket_path);

        let registry = SessionRegistry::start(config, store);
        let connections = Arc::new(ConnectionManager::new(registry.clone()));

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            registry,
            connections,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Run the server, accepting connections and handling requests.
    ///
    /// Returns after a `shutdown` command, once in-flight connections have
    /// finished (or the graceful timeout expired) and every shell has been
    /// terminated.
    pub async fn run(&self) -> Result<()> {
        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted new connection");
                            let ctx = self.context();
                            connection_tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    error!("Connection error: {:#}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        if !connection_tasks.is_empty() {
            info!(
                "Waiting for {} in-flight connection(s) to complete",
                connection_tasks.len()
            );

            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Terminate every shell. Used when the daemon stops on a signal.
    pub async fn teardown(&self) {
        self.registry.teardown().await;
    }

    fn context(&self) -> ServerContext {
        ServerContext {
            registry: self.registry.clone(),
            connections: self.connections.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("Failed to remove PID file on shutdown");
        }
    }
}

fn write_pid(pid_path: &Path) -> Result<()> {
    std::fs::write(pid_path, std::process::id().to_string())
        .with_context(|| format!("Failed to write PID file: {:?}", pid_path))
}

/// Check if a daemon process is still alive by reading its PID file.
fn is_daemon_alive(pid_path: &Path) -> bool {
    let Ok(pid_str) = std::fs::read_to_string(pid_path) else {
        return false;
    };
    let Ok(pid) = pid_str.trim().parse::<i32>() else {
        return false;
    };

    // SAFETY: signal 0 delivers nothing; it only checks that the process
    // exists and may be signalled.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Maximum request size in bytes.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Read a line with a maximum size limit to prevent memory DoS.
///
/// Returns the number of bytes read (0 means EOF).
/// Returns an error if the line exceeds max_size before finding a newline.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;

        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }

        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

/// Read request lines on their own task.
///
/// `read_line_bounded` is not cancel-safe, so it must not sit in a
/// `select!` next to the heartbeat timer.
fn spawn_line_reader(reader: OwnedReadHalf) -> (mpsc::Receiver<Result<String>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = String::new();
            match read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Ok(line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    (rx, handle)
}

/// Write every outbound message as one JSON line until all senders are gone.
fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            trace!("Sending: {}", json);

            let written = async {
                writer.write_all(json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!("Client write failed: {}", e);
                break;
            }
        }
    })
}

/// Queue a response for the writer.
///
/// Returns false when the connection should end: the writer is gone, or the
/// client left the buffer full for longer than `limit`.
async fn queue_response(
    outbound: &mpsc::Sender<ServerMessage>,
    response: Response,
    limit: Duration,
) -> bool {
    match outbound
        .send_timeout(ServerMessage::Response(response), limit)
        .await
    {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => {
            warn!("Client stopped reading for {:?}, dropping connection", limit);
            false
        }
        Err(SendTimeoutError::Closed(_)) => false,
    }
}

/// Handle a single client connection.
///
/// The first request must be `hello`. After that the connection is
/// registered with the connection manager until the client disconnects, the
/// heartbeat times out or a read fails; all of its attachments are then
/// torn down while the panels keep running.
async fn handle_connection(stream: UnixStream, ctx: ServerContext) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let (mut lines, reader_task) = spawn_line_reader(reader);
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let mut writer_task = spawn_writer(writer, outbound_rx);

    let config = ctx.registry.config();
    let heartbeat_timeout = config.heartbeat_timeout;
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    let mut last_seen = Instant::now();
    let mut conn: Option<ConnectionId> = None;

    let result = loop {
        tokio::select! {
            line = lines.recv() => {
                let line = match line {
                    None => {
                        debug!("Client disconnected");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e),
                    Some(Ok(line)) => line,
                };
                last_seen = Instant::now();

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let request = match serde_json::from_str::<Request>(trimmed) {
                    Ok(request) => request,
                    Err(e) => {
                        let response = Response::error(
                            "unknown",
                            ApiError::invalid_input_with_suggestion(
                                format!("Invalid JSON request: {}", e),
                                "Ensure the request is valid JSON with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"list_sessions\"}}",
                            ),
                        );
                        if !queue_response(&outbound, response, heartbeat_timeout).await {
                            break Ok(());
                        }
                        continue;
                    }
                };

                if request.command.is_chatty() {
                    trace!("Handling command: {:?}", request.command);
                } else {
                    debug!("Handling command: {:?}", request.command);
                }

                let reply = match conn {
                    None => Some(handle_hello(request, &ctx, &outbound, &mut conn).into()),
                    Some(id) => handle_request(request, id, &ctx).await,
                };
                if let Some(reply) = reply {
                    if !queue_response(&outbound, reply.response, heartbeat_timeout).await {
                        break Ok(());
                    }
                    if let Some(pending) = reply.then_start {
                        pending.start();
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= heartbeat_timeout {
                    info!(
                        "No traffic for {:?}, dropping connection",
                        heartbeat_timeout
                    );
                    break Ok(());
                }
                // A full buffer already tells the client we are alive.
                match outbound.try_send(ServerMessage::Ping) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break Ok(()),
                }
            }
        }
    };

    reader_task.abort();
    if let Some(id) = conn {
        ctx.connections.unregister(id);
    }
    drop(outbound);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        debug!("Writer still blocked after {:?}, abandoning it", WRITER_DRAIN_TIMEOUT);
        writer_task.abort();
    }
    result
}

/// Handle the first request of a connection, which must be `hello`.
fn handle_hello(
    request: Request,
    ctx: &ServerContext,
    outbound: &mpsc::Sender<ServerMessage>,
    conn: &mut Option<ConnectionId>,
) -> Response {
    let Command::Hello { user_id } = request.command else {
        return Response::error(&request.id, ApiError::unauthenticated());
    };

    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Response::error(
            &request.id,
            ApiError::invalid_input("user_id must not be empty"),
        );
    }

    *conn = Some(ctx.connections.register(user_id, outbound.clone()));
    info!("Connection identified as {}", user_id);
    Response::success(
        &request.id,
        ResponseData::Welcome {
            user_id: user_id.to_string(),
        },
    )
}

/// Handle a request from an identified connection.
///
/// Returns `None` for `pong`, which is itself a reply.
async fn handle_request(request: Request, conn: ConnectionId, ctx: &ServerContext) -> Option<Reply> {
    let id = request.id;
    let user = match ctx.connections.user_of(conn) {
        Ok(user) => user,
        Err(e) => return Some(Response::error(&id, e).into()),
    };
    let registry = &ctx.registry;
    let connections = &ctx.connections;

    let result = match request.command {
        Command::Hello { .. } => Err(ApiError::invalid_input_with_suggestion(
            format!("Connection is already identified as {}", user),
            "Open a new connection to act as a different user",
        )),

        Command::ListSessions => Ok(ResponseData::Sessions {
            sessions: registry.list_sessions(&user).await,
        }),

        Command::CreateSession { name } => registry
            .create_session(&user, name)
            .await
            .map(|session_id| ResponseData::SessionCreated {
                session_id: session_id.0,
            }),

        Command::DestroySession { session_id } => {
            let destroyed = registry
                .destroy_session(&user, &SessionId::from(session_id.clone()))
                .await;
            Ok(ResponseData::Ok {
                message: if destroyed {
                    format!("Session {} destroyed", session_id)
                } else {
                    format!("Session {} was already gone", session_id)
                },
            })
        }

        Command::GetLayout { session_id } => registry
            .get_layout(&user, &SessionId::from(session_id.clone()))
            .await
            .map(|layout| ResponseData::Layout { session_id, layout }),

        Command::CreatePanel { session_id, split } => registry
            .create_panel(&user, &SessionId::from(session_id), split)
            .await
            .map(|(panel_id, layout)| ResponseData::PanelCreated {
                panel_id: panel_id.0,
                layout,
            }),

        Command::ClosePanel { panel_id } => registry
            .close_panel(&user, &PanelId::from(panel_id.clone()))
            .await
            .map(|_| ResponseData::Ok {
                message: format!("Panel {} closed", panel_id),
            }),

        Command::AttachPanel {
            panel_id,
            last_acked,
        } => {
            return Some(handle_attach(&id, conn, ctx, PanelId::from(panel_id), last_acked).await);
        }

        Command::DetachPanel { panel_id } => connections
            .detach_panel(conn, &PanelId::from(panel_id.clone()))
            .map(|()| ResponseData::Ok {
                message: format!("Detached from panel {}", panel_id),
            }),

        Command::Input { panel_id, data } => connections
            .input(conn, &PanelId::from(panel_id), &data)
            .await
            .map(|()| ResponseData::Ok {
                message: format!("Wrote {} bytes", data.len()),
            }),

        Command::Resize {
            panel_id,
            rows,
            cols,
        } => connections
            .resize(conn, &PanelId::from(panel_id), rows, cols)
            .await
            .map(|()| ResponseData::Ok {
                message: format!("Resized to {}x{}", cols, rows),
            }),

        Command::SetSplitRatio {
            session_id,
            path,
            ratio,
        } => registry
            .set_split_ratio(&user, &SessionId::from(session_id.clone()), &path, ratio)
            .await
            .map(|layout| ResponseData::Layout { session_id, layout }),

        Command::Ack { panel_id, sequence } => connections
            .ack(conn, &PanelId::from(panel_id), sequence)
            .map(|acked| ResponseData::Ok {
                message: format!("Acknowledged {}", acked),
            }),

        Command::Pong => return None,

        Command::Shutdown => Ok(handle_shutdown(ctx)),
    };

    let response = match result {
        Ok(data) => Response::success(&id, data),
        Err(e) => Response::error(&id, e),
    };
    Some(response.into())
}

/// Attach the connection to a panel.
///
/// The replay stays held back in the returned [`Reply`] until the
/// `attached` response has been queued.
async fn handle_attach(
    request_id: &str,
    conn: ConnectionId,
    ctx: &ServerContext,
    panel_id: PanelId,
    last_acked: Option<u64>,
) -> Reply {
    match ctx.connections.attach(conn, &panel_id, last_acked).await {
        Ok(pending) => {
            let info = pending.info.clone();
            let response = Response::success(
                request_id,
                ResponseData::Attached {
                    panel_id: info.panel_id,
                    replay_start: info.replay_start,
                    head: info.head,
                    truncated: info.truncated,
                    resync: info.resync,
                },
            );
            Reply {
                response,
                then_start: Some(pending),
            }
        }
        Err(e) => Response::error(request_id, e).into(),
    }
}

/// Handle shutdown command.
fn handle_shutdown(ctx: &ServerContext) -> ResponseData {
    info!("Received shutdown command, stopping daemon");

    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        // Brief delay to allow the response to flush before signaling shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_waiters();
    });

    ResponseData::Ok {
        message: "Daemon shutting down".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tabmux_core::error::ErrorCode;
    use tokio::io::AsyncBufReadExt;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn temp_socket(tag: &str) -> (PathBuf, PathBuf) {
        let short_id = Uuid::new_v4().simple().to_string();
        let socket_path =
            PathBuf::from("/tmp").join(format!("tabmux-{}-{}.sock", tag, &short_id[..8]));
        let pid_path = socket_path.with_extension("pid");
        (socket_path, pid_path)
    }

    fn test_config() -> DaemonConfig {
        DaemonConfig {
            shell: "cat".to_string(),
            kill_grace: Duration::from_millis(200),
            ..DaemonConfig::default()
        }
    }

    async fn start_server(tag: &str, config: DaemonConfig) -> (PathBuf, tokio::task::JoinHandle<()>) {
        let (socket_path, pid_path) = temp_socket(tag);
        let server = DaemonServer::bind_to(
            socket_path.clone(),
            pid_path,
            config,
            Arc::new(MemoryLayoutStore::new()),
        )
        .await
        .expect("Failed to bind server");
        let handle = tokio::spawn(async move {
            let _ = timeout(Duration::from_secs(20), server.run()).await;
        });
        (socket_path, handle)
    }

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        pending: VecDeque<ServerMessage>,
        next_id: u64,
    }

    impl TestClient {
        async fn connect(socket_path: &Path) -> Self {
            let stream = UnixStream::connect(socket_path)
                .await
                .expect("Failed to connect");
            let (reader, writer) = stream.into_split();
            Self {
                reader: BufReader::new(reader),
                writer,
                pending: VecDeque::new(),
                next_id: 1,
            }
        }

        async fn hello(socket_path: &Path, user: &str) -> Self {
            let mut client = Self::connect(socket_path).await;
            let response = client
                .request(Command::Hello {
                    user_id: user.to_string(),
                })
                .await;
            assert!(response.success, "hello failed: {:?}", response.error);
            client
        }

        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }

        /// Next message from the socket, or `None` on EOF.
        async fn read_message(&mut self) -> Option<ServerMessage> {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for the daemon")
                .expect("read failed");
            if n == 0 {
                return None;
            }
            Some(serde_json::from_str(&line).expect("invalid server message"))
        }

        /// Send a command and wait for its response. Pushed messages that
        /// arrive first are kept for [`TestClient::recv`].
        async fn request(&mut self, command: Command) -> Response {
            let id = self.next_id.to_string();
            self.next_id += 1;
            let json = serde_json::to_string(&Request {
                id: id.clone(),
                command,
            })
            .unwrap();
            self.send_line(&json).await;

            loop {
                match self.read_message().await.expect("daemon hung up") {
                    ServerMessage::Response(response) if response.id == id => return response,
                    ServerMessage::Ping => {}
                    other => self.pending.push_back(other),
                }
            }
        }

        /// Next pushed message, skipping pings.
        async fn recv(&mut self) -> ServerMessage {
            if let Some(message) = self.pending.pop_front() {
                return message;
            }
            loop {
                match self.read_message().await.expect("daemon hung up") {
                    ServerMessage::Ping => {}
                    other => return other,
                }
            }
        }

        /// Collect replay and output bytes until `needle` has been seen
        /// `count` times. Returns the bytes and the next expected sequence.
        async fn read_until(&mut self, needle: &str, count: usize) -> (Vec<u8>, u64) {
            let mut got = Vec::new();
            let mut next: Option<u64> = None;
            loop {
                let (start, data) = match self.recv().await {
                    ServerMessage::Replay { start, data, .. } => (start, data),
                    ServerMessage::Output { sequence, data, .. } => (sequence, data),
                    other => panic!("unexpected message {:?}", other),
                };
                if let Some(expected) = next {
                    assert_eq!(start, expected, "gap or overlap in delivered stream");
                }
                next = Some(start + data.len() as u64);
                got.extend_from_slice(&data);
                if String::from_utf8_lossy(&got).matches(needle).count() >= count {
                    return (got, next.unwrap_or_default());
                }
            }
        }
    }

    fn data_of(response: Response) -> ResponseData {
        assert!(response.success, "request failed: {:?}", response.error);
        response.data.expect("response without data")
    }

    async fn open_panel(client: &mut TestClient) -> (String, String) {
        let session_id = match data_of(client.request(Command::CreateSession { name: None }).await) {
            ResponseData::SessionCreated { session_id } => session_id,
            other => panic!("unexpected {:?}", other),
        };
        let panel_id = match data_of(
            client
                .request(Command::CreatePanel {
                    session_id: session_id.clone(),
                    split: None,
                })
                .await,
        ) {
            ResponseData::PanelCreated { panel_id, layout } => {
                assert!(layout.contains(&panel_id));
                panel_id
            }
            other => panic!("unexpected {:?}", other),
        };
        (session_id, panel_id)
    }

    #[tokio::test]
    async fn test_first_request_must_be_hello() {
        let (socket_path, server) = start_server("auth", test_config()).await;
        let mut client = TestClient::connect(&socket_path).await;

        let response = client.request(Command::ListSessions).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::Unauthenticated);

        let response = client
            .request(Command::Hello {
                user_id: "alice".to_string(),
            })
            .await;
        assert_eq!(
            data_of(response),
            ResponseData::Welcome {
                user_id: "alice".to_string()
            }
        );

        let response = client.request(Command::ListSessions).await;
        assert_eq!(data_of(response), ResponseData::Sessions { sessions: vec![] });

        let response = client
            .request(Command::Hello {
                user_id: "mallory".to_string(),
            })
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);

        server.abort();
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_response() {
        let (socket_path, server) = start_server("json", test_config()).await;
        let mut client = TestClient::connect(&socket_path).await;

        client.send_line("{not json").await;
        match client.read_message().await {
            Some(ServerMessage::Response(response)) => {
                assert_eq!(response.id, "unknown");
                assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);
            }
            other => panic!("unexpected {:?}", other),
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_attach_input_and_replay_after_reconnect() {
        let (socket_path, server) = start_server("e2e", test_config()).await;

        let mut first = TestClient::hello(&socket_path, "alice").await;
        let (session_id, panel_id) = open_panel(&mut first).await;

        let response = first
            .request(Command::AttachPanel {
                panel_id: panel_id.clone(),
                last_acked: None,
            })
            .await;
        assert!(
            !first
                .pending
                .iter()
                .any(|m| matches!(m, ServerMessage::Replay { .. })),
            "replay arrived before the attach response"
        );
        match data_of(response) {
            ResponseData::Attached {
                replay_start,
                truncated,
                resync,
                ..
            } => {
                assert_eq!(replay_start, 0);
                assert!(!truncated);
                assert!(!resync);
            }
            other => panic!("unexpected {:?}", other),
        }

        let response = first
            .request(Command::Input {
                panel_id: panel_id.clone(),
                data: b"hello\n".to_vec(),
            })
            .await;
        assert!(response.success);

        // Terminal echo plus cat's copy.
        let (_, acked) = first.read_until("hello\r\n", 2).await;
        let response = first
            .request(Command::Ack {
                panel_id: panel_id.clone(),
                sequence: acked,
            })
            .await;
        assert!(response.success);
        drop(first);

        // Resuming from the ack replays nothing.
        let mut second = TestClient::hello(&socket_path, "alice").await;
        let response = second
            .request(Command::AttachPanel {
                panel_id: panel_id.clone(),
                last_acked: Some(acked),
            })
            .await;
        assert!(response.success);
        match second.recv().await {
            ServerMessage::Replay {
                start, head, data, ..
            } => {
                assert_eq!(start, acked);
                assert_eq!(head, acked);
                assert!(data.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        // A fresh terminal gets the whole history.
        let mut third = TestClient::hello(&socket_path, "alice").await;
        let response = third
            .request(Command::AttachPanel {
                panel_id: panel_id.clone(),
                last_acked: None,
            })
            .await;
        assert!(response.success);
        match third.recv().await {
            ServerMessage::Replay { start, data, .. } => {
                assert_eq!(start, 0);
                assert_eq!(String::from_utf8_lossy(&data).matches("hello").count(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        // The layout survived the disconnect.
        match data_of(third.request(Command::GetLayout { session_id }).await) {
            ResponseData::Layout { layout, .. } => assert_eq!(layout.panel_ids(), vec![panel_id]),
            other => panic!("unexpected {:?}", other),
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_sessions_are_scoped_to_user() {
        let (socket_path, server) = start_server("scope", test_config()).await;

        let mut alice = TestClient::hello(&socket_path, "alice").await;
        let (session_id, panel_id) = open_panel(&mut alice).await;

        let mut bob = TestClient::hello(&socket_path, "bob").await;
        assert_eq!(
            data_of(bob.request(Command::ListSessions).await),
            ResponseData::Sessions { sessions: vec![] }
        );
        let response = bob
            .request(Command::GetLayout {
                session_id: session_id.clone(),
            })
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::SessionNotFound);
        let response = bob
            .request(Command::AttachPanel {
                panel_id,
                last_acked: None,
            })
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::AttachmentConflict);

        server.abort();
    }

    #[tokio::test]
    async fn test_destroy_session_closes_attached_panel() {
        let (socket_path, server) = start_server("destroy", test_config()).await;

        let mut client = TestClient::hello(&socket_path, "alice").await;
        let (session_id, panel_id) = open_panel(&mut client).await;
        let response = client
            .request(Command::AttachPanel {
                panel_id: panel_id.clone(),
                last_acked: None,
            })
            .await;
        assert!(response.success);
        assert!(matches!(client.recv().await, ServerMessage::Replay { .. }));

        let response = client
            .request(Command::DestroySession {
                session_id: session_id.clone(),
            })
            .await;
        assert!(response.success);
        match client.recv().await {
            ServerMessage::PanelClosed {
                panel_id: closed,
                reason,
            } => {
                assert_eq!(closed, panel_id);
                assert_eq!(reason, "session destroyed");
            }
            other => panic!("unexpected {:?}", other),
        }

        // Destroying again is still a success.
        let response = client.request(Command::DestroySession { session_id }).await;
        assert!(response.success);

        server.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_pings_then_drops_silent_client() {
        let config = test_config().with_heartbeat(Duration::from_millis(100));
        let (socket_path, server) = start_server("heartbeat", config).await;

        let mut client = TestClient::connect(&socket_path).await;
        assert_eq!(client.read_message().await, Some(ServerMessage::Ping));

        // Never answer; the daemon hangs up after three intervals.
        loop {
            match client.read_message().await {
                Some(ServerMessage::Ping) => continue,
                None => break,
                other => panic!("unexpected {:?}", other),
            }
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_client_that_stops_reading_is_dropped() {
        let (socket_path, pid_path) = temp_socket("stalled");
        let config = DaemonConfig {
            shell: "yes".to_string(),
            ..test_config()
        }
        .with_heartbeat(Duration::from_millis(100));
        let server = DaemonServer::bind_to(
            socket_path.clone(),
            pid_path,
            config,
            Arc::new(MemoryLayoutStore::new()),
        )
        .await
        .expect("Failed to bind server");
        let connections = server.connections.clone();
        let registry = server.registry.clone();
        let handle = tokio::spawn(async move {
            let _ = timeout(Duration::from_secs(20), server.run()).await;
        });

        let mut client = TestClient::hello(&socket_path, "alice").await;
        let (_, panel_id) = open_panel(&mut client).await;
        let attach = serde_json::to_string(&Request {
            id: "attach".to_string(),
            command: Command::AttachPanel {
                panel_id,
                last_acked: None,
            },
        })
        .unwrap();
        client.send_line(&attach).await;
        assert_eq!(connections.connection_count(), 1);

        // `yes` fills every buffer between the daemon and a client that
        // never reads again; the heartbeat must still hang up on it.
        let deadline = Instant::now() + Duration::from_secs(5);
        while connections.connection_count() != 0 {
            assert!(
                Instant::now() < deadline,
                "connection of a client that stopped reading was never dropped"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // The panel outlives its connection.
        assert_eq!(registry.panel_count().await, 1);

        drop(client);
        handle.abort();
    }

    #[tokio::test]
    async fn test_shutdown_stops_server_and_cleans_up() {
        let (socket_path, pid_path) = temp_socket("shutdown");
        let server = DaemonServer::bind_to(
            socket_path.clone(),
            pid_path.clone(),
            test_config(),
            Arc::new(MemoryLayoutStore::new()),
        )
        .await
        .expect("Failed to bind server");
        assert!(pid_path.exists());

        let handle = tokio::spawn(async move {
            server.run().await.unwrap();
        });

        let mut client = TestClient::hello(&socket_path, "alice").await;
        open_panel(&mut client).await;
        let response = client.request(Command::Shutdown).await;
        assert!(response.success);
        drop(client);

        timeout(Duration::from_secs(10), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(!socket_path.exists());
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn test_read_line_bounded_handles_utf8_chunks() {
        let data = "hello 你好\n".as_bytes().to_vec();
        let cursor = std::io::Cursor::new(data);
        let mut reader = BufReader::with_capacity(1, cursor);
        let mut buf = String::new();

        let bytes = read_line_bounded(&mut reader, &mut buf, 1024)
            .await
            .expect("read line");

        assert!(bytes > 0);
        assert_eq!(buf, "hello 你好\n");
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversized_line() {
        let data = vec![b'x'; 64];
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let mut buf = String::new();

        let err = read_line_bounded(&mut reader, &mut buf, 16)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Request too large"));
    }

    #[tokio::test]
    async fn test_bind_to_creates_socket_parent_dir() {
        let short_id = Uuid::new_v4().simple().to_string();
        let base_dir = PathBuf::from("/tmp").join(format!("tabmux-custom-{}", &short_id[..8]));
        let socket_path = base_dir.join("nested").join("tabmux.sock");
        let pid_path = socket_path.with_extension("pid");

        let server = DaemonServer::bind_to(
            socket_path.clone(),
            pid_path.clone(),
            test_config(),
            Arc::new(MemoryLayoutStore::new()),
        )
        .await
        .expect("Failed to bind server");
        assert!(socket_path.exists());

        drop(server);
        assert!(!socket_path.exists());
        let _ = std::fs::remove_dir_all(&base_dir);
    }

    #[tokio::test]
    async fn test_bind_to_replaces_stale_socket() {
        let (socket_path, pid_path) = temp_socket("stale");
        // A socket left behind by a daemon that no longer runs.
        let stale = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        drop(stale);
        std::fs::write(&pid_path, "999999999").unwrap();

        let server = DaemonServer::bind_to(
            socket_path.clone(),
            pid_path.clone(),
            test_config(),
            Arc::new(MemoryLayoutStore::new()),
        )
        .await
        .expect("stale socket should be replaced");
        assert_eq!(
            std::fs::read_to_string(&pid_path).unwrap(),
            std::process::id().to_string()
        );
        drop(server);
    }

    #[tokio::test]
    async fn test_bind_to_refuses_regular_file() {
        let (socket_path, pid_path) = temp_socket("regular");
        std::fs::write(&socket_path, b"not a socket").unwrap();

        let result = DaemonServer::bind_to(
            socket_path.clone(),
            pid_path,
            test_config(),
            Arc::new(MemoryLayoutStore::new()),
        )
        .await;
        assert!(result.is_err());
        assert!(socket_path.exists());
        let _ = std::fs::remove_file(&socket_path);
    }
}
