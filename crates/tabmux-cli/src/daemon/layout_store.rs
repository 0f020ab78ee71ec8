//! Persistence of session layouts.
//!
//! The registry saves a session's layout after every structural change, so
//! a client that reconnects (or a restarted UI) can rebuild its panel
//! arrangement. Writes are last-writer-wins by layout version, and run on
//! the blocking pool so no registry lock is held across file I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tabmux_core::layout::LayoutTree;
use tracing::{debug, warn};

use crate::daemon::paths;
use crate::daemon::session::SessionId;

/// Storage for one layout document per session.
pub trait LayoutStore: Send + Sync {
    fn save(&self, session_id: &SessionId, layout: &LayoutTree) -> Result<()>;

    /// The stored layout, or `None` if nothing was saved for this session.
    fn load(&self, session_id: &SessionId) -> Result<Option<LayoutTree>>;

    /// Remove a session's layout. Deleting a missing entry is not an error.
    fn delete(&self, session_id: &SessionId) -> Result<()>;
}

/// Layouts as pretty JSON files under `{data_dir}/layouts/`.
pub struct FileLayoutStore {
    dir: PathBuf,
}

impl FileLayoutStore {
    /// Open (creating if needed) the layout directory below `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = paths::layouts_dir(data_dir);
        paths::ensure_private_dir(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: &SessionId) -> Result<PathBuf> {
        if !paths::is_safe_file_stem(&session_id.0) {
            bail!("Refusing to use '{}' as a layout file name", session_id);
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

impl LayoutStore for FileLayoutStore {
    fn save(&self, session_id: &SessionId, layout: &LayoutTree) -> Result<()> {
        let path = self.path_for(session_id)?;
        let json = serde_json::to_vec_pretty(layout).context("Failed to serialize layout")?;

        // Write next to the target and rename so readers never see a torn file.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, &json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
        }

        debug!("Saved layout for session {} ({} bytes)", session_id, json.len());
        Ok(())
    }

    fn load(&self, session_id: &SessionId) -> Result<Option<LayoutTree>> {
        let path = self.path_for(session_id)?;
        let json = match std::fs::read(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let layout = serde_json::from_slice(&json)
            .with_context(|| format!("Corrupt layout file {}", path.display()))?;
        Ok(Some(layout))
    }

    fn delete(&self, session_id: &SessionId) -> Result<()> {
        let path = self.path_for(session_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

/// In-process store for ephemeral daemons and tests.
#[derive(Default)]
pub struct MemoryLayoutStore {
    layouts: Mutex<HashMap<SessionId, LayoutTree>>,
}

impl MemoryLayoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with a stored layout.
    #[cfg(test)]
    pub fn saved_count(&self) -> usize {
        self.layouts.lock().len()
    }
}

impl LayoutStore for MemoryLayoutStore {
    fn save(&self, session_id: &SessionId, layout: &LayoutTree) -> Result<()> {
        self.layouts
            .lock()
            .insert(session_id.clone(), layout.clone());
        Ok(())
    }

    fn load(&self, session_id: &SessionId) -> Result<Option<LayoutTree>> {
        Ok(self.layouts.lock().get(session_id).cloned())
    }

    fn delete(&self, session_id: &SessionId) -> Result<()> {
        self.layouts.lock().remove(session_id);
        Ok(())
    }
}

/// Version marking a deleted session; every later save is stale.
const DELETED: u64 = u64::MAX;

/// The last version of one session's layout that was written.
#[derive(Debug, Default)]
struct Written {
    version: u64,
    ok: bool,
}

/// Applies versioned layout writes to a [`LayoutStore`].
///
/// Callers number each change while holding their own lock and write after
/// releasing it. Writes for one session are serialized, and a write older
/// than the last one applied is skipped, so callers finishing out of order
/// still leave the newest layout in the store.
pub struct LayoutWriter {
    store: Arc<dyn LayoutStore>,
    slots: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<Written>>>>,
}

impl LayoutWriter {
    pub fn new(store: Arc<dyn LayoutStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn slot(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<Written>> {
        self.slots
            .lock()
            .entry(session_id.clone())
            .or_default()
            .clone()
    }

    /// Write `layout` as `version` of the session's layout.
    ///
    /// The write runs on its own task, so it completes even if the caller
    /// is cancelled. Failures are logged; the registry keeps serving its
    /// in-memory copy.
    pub async fn save(self: &Arc<Self>, session_id: SessionId, version: u64, layout: LayoutTree) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let slot = this.slot(&session_id);
            let mut written = slot.lock().await;
            if written.version >= version {
                debug!(
                    "Skipping layout v{} for session {}, v{} already written",
                    version, session_id, written.version
                );
                return;
            }
            let store = this.store.clone();
            let id = session_id.clone();
            let result = tokio::task::spawn_blocking(move || store.save(&id, &layout)).await;
            written.version = version;
            written.ok = match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Failed to persist layout for session {}: {:#}", session_id, e);
                    false
                }
                Err(e) => {
                    warn!("Layout save for session {} did not finish: {}", session_id, e);
                    false
                }
            };
        });
        let _ = task.await;
    }

    /// Remove a session's layout. Saves arriving afterwards are dropped.
    pub async fn delete(self: &Arc<Self>, session_id: SessionId) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let slot = this.slot(&session_id);
            let mut written = slot.lock().await;
            written.version = DELETED;
            written.ok = false;
            let store = this.store.clone();
            let id = session_id.clone();
            match tokio::task::spawn_blocking(move || store.delete(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to delete layout for session {}: {:#}", session_id, e),
                Err(e) => warn!("Layout delete for session {} did not finish: {}", session_id, e),
            }
        });
        let _ = task.await;
    }

    /// Whether the store holds exactly `version` of the session's layout.
    ///
    /// False while a write for the session is in flight.
    pub fn is_saved(&self, session_id: &SessionId, version: u64) -> bool {
        let Some(slot) = self.slots.lock().get(session_id).cloned() else {
            return false;
        };
        let Ok(written) = slot.try_lock() else {
            return false;
        };
        written.ok && written.version == version
    }

    pub async fn load(&self, session_id: &SessionId) -> Result<Option<LayoutTree>> {
        let store = self.store.clone();
        let id = session_id.clone();
        tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .context("Layout load did not finish")?
    }
}
