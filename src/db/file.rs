//! File-backed event history.
//!
//! The whole history lives in memory and is mirrored to one JSON file holding
//! an array of events. Every `put` rewrites that file with the full current
//! map; there is no journal and no append path.
//!
//! Snapshots are written to a sibling `<file>.tmp` and renamed over the target,
//! so readers never observe a half-written array. Writers are serialized, so
//! the file always matches the map as of the last completed `put`.
//!
//! A symlinked history path is resolved first and the link is kept; the temp
//! file takes over the target's permissions. The directory holding the target
//! must be writable, even when the file itself is.

use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsString,
    fs::Permissions,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::{Mutex, OnceLock, PoisonError, RwLock},
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    config::HistoryConfig,
    db::EventHistory,
    domain::Event,
    errors::{HistoryError, Result},
};

pub struct PersistentEventHistory {
    path: PathBuf,
    pretty: bool,
    sync_on_write: bool,
    history: RwLock<BTreeMap<String, Event>>,
    write_lock: tokio::sync::Mutex<()>,
    _claim: PathClaim,
}

impl PersistentEventHistory {
    /// Open the history stored at `path` with default settings.
    ///
    /// See [`PersistentEventHistory::open`].
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(&HistoryConfig::new(path)).await
    }

    /// Load the history file described by `config` and return a ready store.
    ///
    /// A missing file is initialized with `[]`. A zero-byte file loads as an
    /// empty history and is left as is. Anything else must be a JSON array of
    /// events; read failures and malformed content fail the whole call.
    ///
    /// Only one live store may own a given path within this process.
    pub async fn open(config: &HistoryConfig) -> Result<Self> {
        let claim = PathClaim::acquire(&config.path)?;
        let store = Self {
            path: config.path.clone(),
            pretty: config.pretty,
            sync_on_write: config.sync_on_write,
            history: RwLock::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            _claim: claim,
        };
        store.load().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn load(&self) -> Result<()> {
        let contents = match fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "history file missing, initializing");
                let bytes = self.encode(&[])?;
                return self.write_snapshot(&bytes).await;
            }
            Err(err) => return Err(HistoryError::io(&self.path, err)),
        };

        if contents.is_empty() {
            tracing::trace!(path = %self.path.display(), "history file empty, nothing to load");
            return Ok(());
        }

        let events: Vec<Event> = serde_json::from_slice(&contents)
            .map_err(|err| HistoryError::malformed(&self.path, err))?;

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            history.insert(event.id.clone(), event);
        }
        tracing::debug!(
            path = %self.path.display(),
            count = history.len(),
            "loaded event history"
        );

        Ok(())
    }

    fn encode(&self, events: &[&Event]) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(events)?
        } else {
            serde_json::to_vec(events)?
        };
        Ok(bytes)
    }

    async fn write_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let target = self.resolve_target().await?;
        let permissions = match fs::metadata(&target).await {
            Ok(metadata) => Some(metadata.permissions()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(HistoryError::io(&target, err)),
        };
        let tmp_path = temp_path(&target);

        if let Err(err) = self.write_temp(&tmp_path, bytes, permissions).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &target).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(HistoryError::io(&target, err));
        }

        Ok(())
    }

    // Follows symlinks; a path that does not exist yet is written as given.
    async fn resolve_target(&self) -> Result<PathBuf> {
        match fs::canonicalize(&self.path).await {
            Ok(resolved) => Ok(resolved),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(self.path.clone()),
            Err(err) => Err(HistoryError::io(&self.path, err)),
        }
    }

    async fn write_temp(
        &self,
        tmp_path: &Path,
        bytes: &[u8],
        permissions: Option<Permissions>,
    ) -> Result<()> {
        let mut file = fs::File::create(tmp_path)
            .await
            .map_err(|err| HistoryError::io(tmp_path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| HistoryError::io(tmp_path, err))?;
        file.flush()
            .await
            .map_err(|err| HistoryError::io(tmp_path, err))?;
        if self.sync_on_write {
            file.sync_data()
                .await
                .map_err(|err| HistoryError::io(tmp_path, err))?;
        }
        if let Some(permissions) = permissions {
            file.set_permissions(permissions)
                .await
                .map_err(|err| HistoryError::io(tmp_path, err))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHistory for PersistentEventHistory {
    /// Upsert `event`, then rewrite the file with every stored event.
    ///
    /// `updated_at` is normalized first (see [`Event::normalized`]); a refused
    /// timestamp leaves both map and file untouched. Otherwise the map is
    /// updated before the write, and if the write fails the event stays in
    /// memory while the file keeps the previous snapshot.
    async fn put(&self, event: Event) -> Result<()> {
        let event = event.normalized()?;
        let _write = self.write_lock.lock().await;

        let (bytes, count) = {
            let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
            history.insert(event.id.clone(), event);
            let events: Vec<&Event> = history.values().collect();
            (self.encode(&events)?, events.len())
        };

        self.write_snapshot(&bytes).await?;
        tracing::debug!(path = %self.path.display(), count, "persisted event history");

        Ok(())
    }

    fn get(&self) -> Vec<Event> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn claimed_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Process-wide ownership of a history path, released on drop.
struct PathClaim {
    key: PathBuf,
}

impl PathClaim {
    fn acquire(path: &Path) -> Result<Self> {
        let key = claim_key(path).map_err(|err| HistoryError::io(path, err))?;
        let mut claimed = claimed_paths()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(key.clone()) {
            return Err(HistoryError::PathInUse(path.to_path_buf()));
        }
        Ok(Self { key })
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        claimed_paths()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

// Lexical only: symlinks to the same file are not detected.
fn claim_key(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}
