//! Connection manager: client connections and their panel attachments.
//!
//! Each attachment subscribes to its panel's output feed and runs one
//! forwarder task. The forwarder sends the replay as a single message and
//! then relays the live broadcast, so everything an attachment receives is
//! one monotonic, gapless run of sequence numbers. Detaching never touches
//! the PTY or its scrollback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tabmux_core::error::ApiError;
use tabmux_core::protocol::ServerMessage;
use tabmux_core::replay::ReplayPlan;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::daemon::feed::{FeedEvent, OutputFeed, Subscription};
use crate::daemon::session::{PanelId, SessionRegistry};

pub type ConnectionId = u64;

/// Lifecycle of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// Subscribed; the replay has not been released yet.
    Attaching,
    /// Receiving live output and accepting input.
    Attached,
    /// Torn down. Terminal.
    Detached,
}

/// Result of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachInfo {
    pub panel_id: String,
    pub replay_start: u64,
    pub head: u64,
    pub truncated: bool,
    pub resync: bool,
}

/// An attachment whose replay is held back until [`PendingAttach::start`].
///
/// This lets the caller put its own reply on the connection first. Dropping
/// it without starting abandons the replay; the attachment stays
/// `Attaching` until replaced or detached.
#[derive(Debug)]
pub struct PendingAttach {
    pub info: AttachInfo,
    state: Arc<Mutex<AttachmentState>>,
    gate: oneshot::Sender<()>,
}

impl PendingAttach {
    /// Release the replay and accept input.
    pub fn start(self) {
        {
            let mut state = self.state.lock();
            if *state == AttachmentState::Attaching {
                *state = AttachmentState::Attached;
            }
        }
        let _ = self.gate.send(());
    }
}

struct Attachment {
    state: Arc<Mutex<AttachmentState>>,
    /// Highest sequence the client has confirmed rendering.
    last_acked: Option<u64>,
    feed: Arc<OutputFeed>,
    /// Owns the feed subscription; aborting it unsubscribes.
    forwarder: JoinHandle<()>,
}

impl Attachment {
    /// Stop all delivery right away. The feed keeps running.
    fn tear_down(&mut self) {
        *self.state.lock() = AttachmentState::Detached;
        self.forwarder.abort();
    }
}

struct Connection {
    user_id: String,
    outbound: mpsc::Sender<ServerMessage>,
    attachments: HashMap<PanelId, Attachment>,
}

/// Routes input to panels and panel output to connections.
pub struct ConnectionManager {
    registry: Arc<SessionRegistry>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_connection: AtomicU64,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Register an authenticated connection. `outbound` carries every
    /// message destined for it.
    pub fn register(&self, user_id: &str, outbound: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(
            id,
            Connection {
                user_id: user_id.to_string(),
                outbound,
                attachments: HashMap::new(),
            },
        );
        debug!("Connection {} registered for {}", id, user_id);
        id
    }

    /// Detach everything and forget the connection.
    pub fn unregister(&self, conn: ConnectionId) {
        let count = self.detach(conn);
        if self.connections.lock().remove(&conn).is_some() {
            debug!(
                "Connection {} unregistered ({} attachment(s) dropped)",
                conn, count
            );
        }
    }

    /// The user a connection identified as.
    pub fn user_of(&self, conn: ConnectionId) -> Result<String, ApiError> {
        self.connections
            .lock()
            .get(&conn)
            .map(|c| c.user_id.clone())
            .ok_or_else(ApiError::unauthenticated)
    }

    /// Attach a connection to a panel.
    ///
    /// The replay is computed atomically with the feed subscription, so live
    /// output continues exactly at `info.head`. Reattaching a panel already
    /// attached on this connection replaces the old attachment; without an
    /// explicit `last_acked` it resumes from the old attachment's last ack.
    pub async fn attach(
        &self,
        conn: ConnectionId,
        panel_id: &PanelId,
        last_acked: Option<u64>,
    ) -> Result<PendingAttach, ApiError> {
        let user_id = self.user_of(conn)?;
        let panel = self.registry.panel(&user_id, panel_id).await?;

        let mut connections = self.connections.lock();
        let connection = connections
            .get_mut(&conn)
            .ok_or_else(ApiError::unauthenticated)?;

        let mut last_acked = last_acked;
        if let Some(mut previous) = connection.attachments.remove(panel_id) {
            last_acked = last_acked.or(previous.last_acked);
            previous.tear_down();
            debug!("Connection {} reattaching panel {}", conn, panel_id);
        }

        let Subscription { plan, live } =
            panel.feed.subscribe(last_acked).map_err(|closed| {
                debug!("Attach to closed panel {}: {}", panel_id, closed.reason);
                ApiError::process_terminated(&panel_id.0)
            })?;

        let info = AttachInfo {
            panel_id: panel_id.0.clone(),
            replay_start: plan.start,
            head: plan.head,
            truncated: plan.truncated,
            resync: plan.is_resync(last_acked),
        };

        let (gate, gate_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward(
            panel_id.clone(),
            plan,
            info.resync,
            panel.feed.clone(),
            live,
            connection.outbound.clone(),
            gate_rx,
        ));

        let state = Arc::new(Mutex::new(AttachmentState::Attaching));
        connection.attachments.insert(
            panel_id.clone(),
            Attachment {
                state: state.clone(),
                last_acked: last_acked.filter(|acked| *acked <= info.head),
                feed: panel.feed.clone(),
                forwarder,
            },
        );

        info!(
            "Connection {} attached panel {} (replay [{}, {}) truncated={})",
            conn, panel_id, info.replay_start, info.head, info.truncated
        );
        Ok(PendingAttach { info, state, gate })
    }

    /// Verify an `Attached` attachment and return the connection's user.
    fn attached_user(&self, conn: ConnectionId, panel_id: &PanelId) -> Result<String, ApiError> {
        let connections = self.connections.lock();
        let connection = connections.get(&conn).ok_or_else(ApiError::unauthenticated)?;
        match connection.attachments.get(panel_id) {
            Some(a) if *a.state.lock() == AttachmentState::Attached => {
                Ok(connection.user_id.clone())
            }
            _ => Err(ApiError::not_attached(&panel_id.0)),
        }
    }

    /// Forward keyboard input to an attached panel.
    pub async fn input(
        &self,
        conn: ConnectionId,
        panel_id: &PanelId,
        data: &[u8],
    ) -> Result<(), ApiError> {
        let user_id = self.attached_user(conn, panel_id)?;
        self.registry.write_to_panel(&user_id, panel_id, data).await
    }

    /// Resize an attached panel's terminal.
    pub async fn resize(
        &self,
        conn: ConnectionId,
        panel_id: &PanelId,
        rows: u16,
        cols: u16,
    ) -> Result<(), ApiError> {
        let user_id = self.attached_user(conn, panel_id)?;
        self.registry
            .resize_panel(&user_id, panel_id, rows, cols)
            .await
    }

    /// Record that the client rendered output up to `sequence`.
    ///
    /// Acks only move forward and never past what the PTY produced.
    pub fn ack(&self, conn: ConnectionId, panel_id: &PanelId, sequence: u64) -> Result<u64, ApiError> {
        let mut connections = self.connections.lock();
        let attachment = connections
            .get_mut(&conn)
            .ok_or_else(ApiError::unauthenticated)?
            .attachments
            .get_mut(panel_id)
            .ok_or_else(|| ApiError::not_attached(&panel_id.0))?;

        let clamped = sequence.min(attachment.feed.head());
        let acked = attachment.last_acked.map_or(clamped, |prev| prev.max(clamped));
        attachment.last_acked = Some(acked);
        Ok(acked)
    }

    /// Stop receiving one panel on this connection.
    pub fn detach_panel(&self, conn: ConnectionId, panel_id: &PanelId) -> Result<(), ApiError> {
        let mut connections = self.connections.lock();
        let connection = connections
            .get_mut(&conn)
            .ok_or_else(ApiError::unauthenticated)?;
        let mut attachment = connection
            .attachments
            .remove(panel_id)
            .ok_or_else(|| ApiError::not_attached(&panel_id.0))?;
        attachment.tear_down();
        debug!("Connection {} detached panel {}", conn, panel_id);
        Ok(())
    }

    /// Remove every attachment of a connection and return how many there
    /// were. The connection stays registered; PTYs are untouched.
    pub fn detach(&self, conn: ConnectionId) -> usize {
        let mut connections = self.connections.lock();
        let Some(connection) = connections.get_mut(&conn) else {
            return 0;
        };
        let count = connection.attachments.len();
        for (_, mut attachment) in connection.attachments.drain() {
            attachment.tear_down();
        }
        count
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    #[cfg(test)]
    fn state_of(&self, conn: ConnectionId, panel_id: &PanelId) -> Option<AttachmentState> {
        self.connections
            .lock()
            .get(&conn)?
            .attachments
            .get(panel_id)
            .map(|a| *a.state.lock())
    }

    #[cfg(test)]
    fn last_acked(&self, conn: ConnectionId, panel_id: &PanelId) -> Option<u64> {
        self.connections
            .lock()
            .get(&conn)?
            .attachments
            .get(panel_id)?
            .last_acked
    }
}

/// Deliver one attachment's replay and then its live output.
///
/// Chunks skipped after falling behind the broadcast are refilled from
/// scrollback, so the client only sees a sequence jump when that history
/// was evicted as well.
async fn forward(
    panel_id: PanelId,
    plan: ReplayPlan,
    resync: bool,
    feed: Arc<OutputFeed>,
    mut live: broadcast::Receiver<FeedEvent>,
    outbound: mpsc::Sender<ServerMessage>,
    gate: oneshot::Receiver<()>,
) {
    if gate.await.is_err() {
        return;
    }

    let replay = ServerMessage::Replay {
        panel_id: panel_id.0.clone(),
        start: plan.start,
        head: plan.head,
        truncated: plan.truncated,
        resync,
        notice: plan.notice().map(str::to_string),
        data: plan.bytes,
    };
    if outbound.send(replay).await.is_err() {
        return;
    }

    let mut next = plan.head;
    loop {
        let event = match live.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    "Panel {}: attachment fell {} chunk(s) behind, refilling from scrollback",
                    panel_id, skipped
                );
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let message = match event {
            FeedEvent::Output { sequence, data } => {
                if sequence > next {
                    let missing = feed.read_between(next, sequence);
                    if missing.truncated {
                        warn!(
                            "Panel {}: bytes [{}, {}) were evicted before delivery",
                            panel_id, next, missing.start
                        );
                    }
                    if !missing.bytes.is_empty() {
                        let refill = ServerMessage::Output {
                            panel_id: panel_id.0.clone(),
                            sequence: missing.start,
                            data: missing.bytes,
                        };
                        if outbound.send(refill).await.is_err() {
                            return;
                        }
                    }
                }
                next = sequence + data.len() as u64;
                ServerMessage::Output {
                    panel_id: panel_id.0.clone(),
                    sequence,
                    data: data.to_vec(),
                }
            }
            FeedEvent::Closed { reason } => ServerMessage::PanelClosed {
                panel_id: panel_id.0.clone(),
                reason,
            },
        };
        if outbound.send(message).await.is_err() {
            debug!("Outbound channel closed, forwarder for {} exiting", panel_id);
            return;
        }
    }
}
