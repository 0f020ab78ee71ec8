//! Terminal session registry: sessions, their panels and the PTY behind each
//! panel.
//!
//! A session's layout tree and its panel table always change together under
//! the registry's write lock, so every panel in a layout has exactly one PTY
//! entry and vice versa. Layout changes are numbered under that lock and
//! written to the store after it is released. Each PTY gets one pump task,
//! the only writer to its output feed. When the pump sees the shell exit it
//! closes the feed (which notifies every attachment) and hands the panel to
//! the reaper.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tabmux_core::error::ApiError;
use tabmux_core::layout::{Branch, LayoutError, LayoutTree, SplitSpec};
use tabmux_core::protocol::{PanelInfo, SessionInfo};

use crate::daemon::config::DaemonConfig;
use crate::daemon::feed::OutputFeed;
use crate::daemon::layout_store::{LayoutStore, LayoutWriter};
use crate::daemon::pty::{PtyError, PtyHandle, TermSize};

/// Defines a uuid-backed string identifier.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new unique ID.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a session.
    SessionId
);
string_id!(
    /// Unique identifier for a panel.
    PanelId
);
string_id!(
    /// Unique identifier for the PTY bound to a panel.
    PtyId
);

/// Longest accepted session display name.
const MAX_SESSION_NAME_LEN: usize = 64;

/// How long the pump waits for an exit status after the PTY hits EOF.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

/// A panel's shell: process handle, output feed and bookkeeping.
pub struct PanelPty {
    pub id: PanelId,
    pub session_id: SessionId,
    pub owner: String,
    pub pty_id: PtyId,
    pub handle: PtyHandle,
    pub feed: Arc<OutputFeed>,
    last_activity: parking_lot::Mutex<DateTime<Utc>>,
}

impl std::fmt::Debug for PanelPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelPty")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("pty_id", &self.pty_id)
            .field("pid", &self.handle.pid())
            .finish_non_exhaustive()
    }
}

impl PanelPty {
    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Whether the shell is still producing output.
    pub fn is_alive(&self) -> bool {
        !self.feed.is_closed()
    }

    pub fn info(&self) -> PanelInfo {
        let size = self.handle.size();
        PanelInfo {
            id: self.id.0.clone(),
            pty_id: self.pty_id.0.clone(),
            head: self.feed.head(),
            tail: self.feed.tail(),
            cols: size.cols,
            rows: size.rows,
            attachments: self.feed.subscriber_count(),
            last_activity: self.last_activity().to_rfc3339(),
            alive: self.is_alive(),
        }
    }
}

/// A logical workspace owned by one user.
struct Session {
    id: SessionId,
    owner: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    layout: LayoutTree,
    /// Bumped on every layout change.
    layout_version: u64,
    panels: HashMap<PanelId, Arc<PanelPty>>,
}

/// A layout taken under the registry lock, written once it is released.
struct LayoutSave {
    session_id: SessionId,
    version: u64,
    layout: LayoutTree,
}

impl Session {
    /// Record a layout change and snapshot it for the store.
    fn layout_changed(&mut self) -> LayoutSave {
        self.layout_version += 1;
        LayoutSave {
            session_id: self.id.clone(),
            version: self.layout_version,
            layout: self.layout.clone(),
        }
    }

    fn info(&self) -> SessionInfo {
        let panels = self
            .layout
            .panel_ids()
            .into_iter()
            .filter_map(|id| self.panels.get(&PanelId(id)))
            .map(|panel| panel.info())
            .collect();
        SessionInfo {
            id: self.id.0.clone(),
            name: self.name.clone(),
            created_at: self.created_at.to_rfc3339(),
            panels,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    /// Which session each live panel belongs to.
    panel_sessions: HashMap<PanelId, SessionId>,
}

impl RegistryState {
    /// A session owned by `owner`. Foreign sessions look missing.
    fn session(&self, owner: &str, id: &SessionId) -> Result<&Session, ApiError> {
        self.sessions
            .get(id)
            .filter(|s| s.owner == owner)
            .ok_or_else(|| ApiError::session_not_found(&id.0))
    }

    fn session_mut(&mut self, owner: &str, id: &SessionId) -> Result<&mut Session, ApiError> {
        self.sessions
            .get_mut(id)
            .filter(|s| s.owner == owner)
            .ok_or_else(|| ApiError::session_not_found(&id.0))
    }

    fn panel(&self, owner: &str, panel_id: &PanelId) -> Result<&Arc<PanelPty>, ApiError> {
        self.panel_sessions
            .get(panel_id)
            .and_then(|session_id| self.sessions.get(session_id))
            .and_then(|session| session.panels.get(panel_id))
            .filter(|panel| panel.owner == owner)
            .ok_or_else(|| ApiError::panel_not_found(&panel_id.0))
    }

    /// Remove a panel from its session's table and layout in one step.
    fn remove_panel(&mut self, panel_id: &PanelId) -> Option<(Arc<PanelPty>, &mut Session)> {
        let session_id = self.panel_sessions.remove(panel_id)?;
        let session = self.sessions.get_mut(&session_id)?;
        let panel = session.panels.remove(panel_id)?;
        session.layout.remove_panel(&panel_id.0);
        Some((panel, session))
    }
}

/// Sent by a pump once its shell has exited.
struct PanelExit {
    panel_id: PanelId,
    reason: String,
}

fn layout_error(err: LayoutError) -> ApiError {
    match err {
        LayoutError::PanelNotInLayout(id) => ApiError::panel_not_found(&id),
        other => ApiError::invalid_input(other.to_string()),
    }
}

/// Process-wide map of sessions to panels and PTYs.
///
/// Construct with [`SessionRegistry::start`]; tests build their own.
pub struct SessionRegistry {
    config: DaemonConfig,
    layouts: Arc<LayoutWriter>,
    state: RwLock<RegistryState>,
    exit_tx: mpsc::UnboundedSender<PanelExit>,
}

impl SessionRegistry {
    /// Create a registry and start its reaper task.
    pub fn start(config: DaemonConfig, store: Arc<dyn LayoutStore>) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            config,
            layouts: LayoutWriter::new(store),
            state: RwLock::new(RegistryState::default()),
            exit_tx,
        });
        registry.spawn_reaper(exit_rx);
        registry
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Create an empty session for `owner`.
    pub async fn create_session(
        &self,
        owner: &str,
        name: Option<String>,
    ) -> Result<SessionId, ApiError> {
        if let Some(ref n) = name {
            if n.chars().count() > MAX_SESSION_NAME_LEN {
                return Err(ApiError::invalid_input(format!(
                    "Session name is longer than {} characters",
                    MAX_SESSION_NAME_LEN
                )));
            }
        }

        let id = SessionId::new();
        let save = {
            let mut state = self.state.write().await;
            if state.sessions.len() >= self.config.max_sessions {
                return Err(ApiError::limit_reached("session", self.config.max_sessions));
            }
            let mut session = Session {
                id: id.clone(),
                owner: owner.to_string(),
                name,
                created_at: Utc::now(),
                layout: LayoutTree::new(),
                layout_version: 0,
                panels: HashMap::new(),
            };
            let save = session.layout_changed();
            state.sessions.insert(id.clone(), session);
            save
        };
        self.persist(save).await;

        info!("Created session {} for {}", id, owner);
        Ok(id)
    }

    /// Spawn a shell in a new panel and insert it into the layout.
    ///
    /// The spawn happens outside the lock; the table and the layout are then
    /// updated together. If the session disappeared meanwhile the new shell
    /// is killed.
    pub async fn create_panel(
        &self,
        owner: &str,
        session_id: &SessionId,
        split: Option<SplitSpec>,
    ) -> Result<(PanelId, LayoutTree), ApiError> {
        // Fail fast before spawning a process.
        {
            let state = self.state.read().await;
            let session = state.session(owner, session_id)?;
            self.check_panel_room(session)?;
            if let Some(spec) = &split {
                if !session.layout.contains(&spec.target_panel) {
                    return Err(ApiError::panel_not_found(&spec.target_panel));
                }
            }
        }

        let command = self.config.shell_command();
        let handle = PtyHandle::spawn(&command, self.config.default_size).map_err(|e| {
            let reason = match e {
                PtyError::Spawn { reason, .. } => reason,
                other => other.to_string(),
            };
            warn!("Panel spawn failed in session {}: {}", session_id, reason);
            ApiError::spawn_failed(&command.argv(), &reason)
        })?;
        let output = handle
            .take_output()
            .ok_or_else(|| ApiError::internal("PTY output stream already taken"))?;

        let panel = Arc::new(PanelPty {
            id: PanelId::new(),
            session_id: session_id.clone(),
            owner: owner.to_string(),
            pty_id: PtyId::new(),
            handle,
            feed: Arc::new(OutputFeed::new(
                self.config.scrollback_bytes,
                self.config.queue_capacity,
            )),
            last_activity: parking_lot::Mutex::new(Utc::now()),
        });

        let save = {
            let mut state = self.state.write().await;
            match self.bind_panel(&mut state, owner, session_id, &panel, split.as_ref()) {
                Ok(save) => save,
                Err(e) => {
                    drop(state);
                    panel.handle.kill();
                    return Err(e);
                }
            }
        };
        let layout = save.layout.clone();
        self.persist(save).await;

        self.spawn_pump(panel.clone(), output);
        info!(
            "Created panel {} (pty {}, pid {:?}) in session {}",
            panel.id,
            panel.pty_id,
            panel.handle.pid(),
            session_id
        );
        Ok((panel.id.clone(), layout))
    }

    fn check_panel_room(&self, session: &Session) -> Result<(), ApiError> {
        if session.panels.len() >= self.config.max_panels_per_session {
            return Err(ApiError::limit_reached(
                "panel",
                self.config.max_panels_per_session,
            ));
        }
        Ok(())
    }

    /// Insert a spawned panel into its session. Caller holds the write lock.
    fn bind_panel(
        &self,
        state: &mut RegistryState,
        owner: &str,
        session_id: &SessionId,
        panel: &Arc<PanelPty>,
        split: Option<&SplitSpec>,
    ) -> Result<LayoutSave, ApiError> {
        let session = state.session_mut(owner, session_id)?;
        self.check_panel_room(session)?;
        session
            .layout
            .insert_panel(&panel.id.0, split)
            .map_err(layout_error)?;
        session.panels.insert(panel.id.clone(), panel.clone());
        let save = session.layout_changed();
        state
            .panel_sessions
            .insert(panel.id.clone(), session_id.clone());
        Ok(save)
    }

    /// Close a panel and end its shell in the background.
    pub async fn close_panel(&self, owner: &str, panel_id: &PanelId) -> Result<LayoutTree, ApiError> {
        let (panel, save) = {
            let mut state = self.state.write().await;
            state.panel(owner, panel_id)?;
            let Some((panel, session)) = state.remove_panel(panel_id) else {
                return Err(ApiError::panel_not_found(&panel_id.0));
            };
            (panel, session.layout_changed())
        };
        let layout = save.layout.clone();
        self.persist(save).await;

        panel.feed.close("panel closed");
        self.terminate_in_background(panel);
        info!("Closed panel {}", panel_id);
        Ok(layout)
    }

    /// The layout a reloading client rebuilds its panels from.
    ///
    /// Served from the layout store so clients see exactly what was
    /// persisted; the in-memory copy is used while the store lags behind
    /// it or after a failed save.
    pub async fn get_layout(&self, owner: &str, session_id: &SessionId) -> Result<LayoutTree, ApiError> {
        let (current, version) = {
            let state = self.state.read().await;
            let session = state.session(owner, session_id)?;
            (session.layout.clone(), session.layout_version)
        };
        if !self.layouts.is_saved(session_id, version) {
            return Ok(current);
        }
        match self.layouts.load(session_id).await {
            Ok(Some(layout)) => Ok(layout),
            Ok(None) => Ok(current),
            Err(e) => {
                warn!("Failed to load layout for session {}: {:#}", session_id, e);
                Ok(current)
            }
        }
    }

    /// Move the divider of the split node at `path`.
    pub async fn set_split_ratio(
        &self,
        owner: &str,
        session_id: &SessionId,
        path: &[Branch],
        ratio: f32,
    ) -> Result<LayoutTree, ApiError> {
        let save = {
            let mut state = self.state.write().await;
            let session = state.session_mut(owner, session_id)?;
            session.layout.set_ratio(path, ratio).map_err(layout_error)?;
            session.layout_changed()
        };
        let layout = save.layout.clone();
        self.persist(save).await;
        Ok(layout)
    }

    /// Destroy a session and everything in it.
    ///
    /// Returns whether anything was destroyed; destroying a missing (or
    /// foreign) session is a no-op. Shells are terminated on background
    /// tasks, so this never waits on a slow process.
    pub async fn destroy_session(&self, owner: &str, session_id: &SessionId) -> bool {
        let session = {
            let mut state = self.state.write().await;
            if state.session(owner, session_id).is_err() {
                debug!("Destroy of unknown session {} ignored", session_id);
                return false;
            }
            let Some(session) = state.sessions.remove(session_id) else {
                return false;
            };
            for panel_id in session.panels.keys() {
                state.panel_sessions.remove(panel_id);
            }
            session
        };
        self.layouts.delete(session_id.clone()).await;

        let panel_count = session.panels.len();
        for panel in session.panels.into_values() {
            panel.feed.close("session destroyed");
            self.terminate_in_background(panel);
        }
        info!(
            "Destroyed session {} ({} panel(s) terminating)",
            session_id, panel_count
        );
        true
    }

    /// The caller's sessions, oldest first.
    pub async fn list_sessions(&self, owner: &str) -> Vec<SessionInfo> {
        let state = self.state.read().await;
        let mut sessions: Vec<&Session> = state
            .sessions
            .values()
            .filter(|s| s.owner == owner)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions.into_iter().map(|s| s.info()).collect()
    }

    /// Look up a panel owned by `owner`.
    pub async fn panel(&self, owner: &str, panel_id: &PanelId) -> Result<Arc<PanelPty>, ApiError> {
        let state = self.state.read().await;
        state.panel(owner, panel_id).cloned()
    }

    /// Send keyboard input to a panel's shell.
    ///
    /// Writing to a dead shell reaps the panel and reports
    /// `PROCESS_TERMINATED`.
    pub async fn write_to_panel(
        &self,
        owner: &str,
        panel_id: &PanelId,
        data: &[u8],
    ) -> Result<(), ApiError> {
        let panel = self.panel(owner, panel_id).await?;
        match panel.handle.write(data).await {
            Ok(()) => {
                panel.touch();
                Ok(())
            }
            Err(PtyError::ProcessTerminated) => {
                self.reap_panel(panel_id, "process terminated").await;
                Err(ApiError::process_terminated(&panel_id.0))
            }
            Err(e) => Err(ApiError::command_failed(format!("Failed to write: {}", e))),
        }
    }

    /// Resize a panel's terminal.
    pub async fn resize_panel(
        &self,
        owner: &str,
        panel_id: &PanelId,
        rows: u16,
        cols: u16,
    ) -> Result<(), ApiError> {
        if rows == 0 || cols == 0 {
            return Err(ApiError::invalid_input_with_suggestion(
                format!("Invalid terminal size {}x{}", cols, rows),
                "Rows and columns must both be at least 1",
            ));
        }
        let panel = self.panel(owner, panel_id).await?;
        match panel.handle.resize(TermSize { cols, rows }).await {
            Ok(()) => Ok(()),
            Err(PtyError::ProcessTerminated) => {
                self.reap_panel(panel_id, "process terminated").await;
                Err(ApiError::process_terminated(&panel_id.0))
            }
            Err(e) => Err(ApiError::command_failed(format!("Failed to resize: {}", e))),
        }
    }

    /// Terminate every shell and wait for them (bounded by the kill grace).
    ///
    /// Called once at daemon shutdown. Persisted layouts are deleted since
    /// their shells do not survive the daemon.
    pub async fn teardown(&self) {
        let sessions = {
            let mut state = self.state.write().await;
            state.panel_sessions.clear();
            std::mem::take(&mut state.sessions)
        };

        let grace = self.config.kill_grace;
        let mut tasks = JoinSet::new();
        for (id, session) in sessions {
            self.layouts.delete(id).await;
            for panel in session.panels.into_values() {
                panel.feed.close("daemon shutting down");
                tasks.spawn(async move { panel.handle.terminate(grace).await });
            }
        }

        let count = tasks.len();
        while tasks.join_next().await.is_some() {}
        if count > 0 {
            info!("Terminated {} shell(s)", count);
        }
    }

    /// Write a layout snapshot. Call without holding the state lock.
    async fn persist(&self, save: LayoutSave) {
        self.layouts
            .save(save.session_id, save.version, save.layout)
            .await;
    }

    fn terminate_in_background(&self, panel: Arc<PanelPty>) {
        let grace = self.config.kill_grace;
        tokio::spawn(async move {
            panel.handle.terminate(grace).await;
            debug!("Panel {} terminated", panel.id);
        });
    }

    /// Drop a dead panel from its session. Returns whether it was present.
    async fn reap_panel(&self, panel_id: &PanelId, reason: &str) -> bool {
        let (panel, save) = {
            let mut state = self.state.write().await;
            let Some((panel, session)) = state.remove_panel(panel_id) else {
                return false;
            };
            (panel, session.layout_changed())
        };
        self.persist(save).await;

        panel.feed.close(reason);
        self.terminate_in_background(panel);
        info!("Reaped panel {}: {}", panel_id, reason);
        true
    }

    /// Move a PTY's output into its feed until the shell exits.
    fn spawn_pump(&self, panel: Arc<PanelPty>, mut output: mpsc::Receiver<Vec<u8>>) {
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                panel.feed.append(&chunk);
                panel.touch();
            }

            let reason = match panel.handle.wait_exit(EXIT_STATUS_WAIT).await {
                Some(code) => format!("process exited with code {}", code),
                None => "terminal closed".to_string(),
            };
            debug!(
                "Panel {} in session {} output ended: {}",
                panel.id, panel.session_id, reason
            );
            panel.feed.close(&reason);
            let _ = exit_tx.send(PanelExit {
                panel_id: panel.id.clone(),
                reason,
            });
        });
    }

    /// Remove panels whose shells exited.
    ///
    /// The task runs until the registry is dropped (via the weak reference).
    fn spawn_reaper(self: &Arc<Self>, mut exits: mpsc::UnboundedReceiver<PanelExit>) {
        let weak_self: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                let Some(registry) = weak_self.upgrade() else {
                    break;
                };
                registry.reap_panel(&exit.panel_id, &exit.reason).await;
            }
            debug!("SessionRegistry dropped, reaper exiting");
        });
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    #[cfg(test)]
    pub async fn panel_count(&self) -> usize {
        self.state.read().await.panel_sessions.len()
    }
}
