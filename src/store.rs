//! Namespaced, quota-aware persistent key-value store.
//!
//! Durable storage for credentials and the optimistic-mutation ledger.
//! Backed by a pluggable [`StorageBackend`] (whole-document snapshot load
//! and persist):
//!
//! - [`FileBackend`]: one JSON document on disk, parent directories created
//!   on demand, 0600 permissions on Unix.
//! - [`MemoryBackend`]: in-process map, cloneable so two stores can share
//!   one backend the way two browser tabs share localStorage.
//!
//! Writes are debounced: rapid repeated `set` calls within the configured
//! window coalesce into one physical persist. Removals persist immediately
//! and verify the post-condition by re-reading the backend. External
//! changes to the same namespace (another context writing the shared
//! backend) are observed via [`poll_external`](KeyValueStore::poll_external)
//! and broadcast to subscribers; this is how a forced logout in one
//! context propagates to others.

use crate::error::{LaneLinkError, Result};
use crate::models::envelope::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default quota for one namespace (5 MiB, the conventional localStorage
/// budget).
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Default debounce window for coalescing physical writes.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Format version stamped into every persisted entry.
const ENTRY_FORMAT_VERSION: &str = "1";

/// Capacity of the external-change broadcast channel.
const EXTERNAL_CHANNEL_CAPACITY: usize = 64;

// ── Persisted representation ────────────────────────────────────────────────

/// Persisted representation of one stored value.
///
/// Wire shape: `{ "value": <opaque>, "timestamp": number, "type": string,
/// "version": string }`, keyed under `<prefix>_<key>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEntry {
    /// The opaque stored value.
    pub value: JsonValue,
    /// Millis since Unix epoch when the entry was written. Eviction
    /// candidates are ranked by this field, ascending.
    pub timestamp: u64,
    /// Caller-supplied tag describing what the value is (e.g. `session`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Entry format version.
    pub version: String,
}

impl StoredEntry {
    fn approximate_size(&self, full_key: &str) -> usize {
        let body = serde_json::to_string(self).map(|s| s.len()).unwrap_or(0);
        full_key.len() + body
    }
}

/// Notification of an externally-made change observed in the backend.
#[derive(Debug, Clone)]
pub struct ExternalChange {
    /// Key within the namespace (prefix stripped).
    pub key: String,
    /// New value, or `None` when the entry was removed externally.
    pub value: Option<JsonValue>,
}

// ── Backends ────────────────────────────────────────────────────────────────

/// Storage backend contract: load and persist a whole-document snapshot.
///
/// Implementations must be cheap to load; the store keeps an in-memory
/// mirror and only touches the backend on (debounced) persists, removals,
/// and external polls.
pub trait StorageBackend: Send + Sync {
    /// Load the full snapshot. A missing document yields an empty map.
    fn load(&self) -> Result<HashMap<String, StoredEntry>>;

    /// Persist the full snapshot, replacing whatever was there.
    fn persist(&self, snapshot: &HashMap<String, StoredEntry>) -> Result<()>;
}

/// In-process backend. Cloning shares the underlying map, so two stores
/// constructed over clones observe each other's persisted writes, the
/// test stand-in for two browser tabs sharing localStorage.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<StdMutex<HashMap<String, StoredEntry>>>,
    persist_count: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical persists performed. Used to assert debounce
    /// coalescing in tests.
    pub fn persist_count(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self) -> Result<HashMap<String, StoredEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| LaneLinkError::Internal(e.to_string()))?;
        Ok(entries.clone())
    }

    fn persist(&self, snapshot: &HashMap<String, StoredEntry>) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| LaneLinkError::Internal(e.to_string()))?;
        *entries = snapshot.clone();
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// File-backed storage: the whole namespace as one JSON document.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Create a backend persisting to `path`. The file and its parent
    /// directories are created on first persist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StorageBackend for FileBackend {
    fn load(&self) -> Result<HashMap<String, StoredEntry>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|e| {
                    LaneLinkError::Storage(format!(
                        "Corrupt store document {}: {}",
                        self.path.display(),
                        e
                    ))
                })
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(LaneLinkError::Storage(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn persist(&self, snapshot: &HashMap<String, StoredEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LaneLinkError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let text = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&self.path, text).map_err(|e| {
            LaneLinkError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        // Credentials live in this document; keep it private.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms).map_err(|e| {
                LaneLinkError::Storage(format!(
                    "Failed to set permissions on {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

struct StoreState {
    /// Full mirror of the backend document, including keys outside our
    /// prefix (persists must not clobber other namespaces).
    entries: HashMap<String, StoredEntry>,
    dirty: bool,
    flush_scheduled: bool,
}

struct StoreShared {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    quota_bytes: usize,
    debounce_window: Duration,
    state: StdMutex<StoreState>,
    external_tx: broadcast::Sender<ExternalChange>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

/// Namespaced, quota-aware, debounced key-value store.
///
/// Cloning is cheap and shares the same in-memory mirror.
#[derive(Clone)]
pub struct KeyValueStore {
    shared: Arc<StoreShared>,
}

impl KeyValueStore {
    /// Open a store over `backend`, namespaced by `prefix`.
    ///
    /// Loads the current backend snapshot into the in-memory mirror.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        prefix: impl Into<String>,
        quota_bytes: usize,
        debounce_window: Duration,
    ) -> Result<Self> {
        let entries = backend.load()?;
        let (external_tx, _) = broadcast::channel(EXTERNAL_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(StoreShared {
                backend,
                prefix: prefix.into(),
                quota_bytes,
                debounce_window,
                state: StdMutex::new(StoreState {
                    entries,
                    dirty: false,
                    flush_scheduled: false,
                }),
                external_tx,
                poller: StdMutex::new(None),
            }),
        })
    }

    /// Open a store with the default quota and debounce window.
    pub fn with_defaults(backend: Arc<dyn StorageBackend>, prefix: impl Into<String>) -> Result<Self> {
        Self::new(backend, prefix, DEFAULT_QUOTA_BYTES, DEFAULT_DEBOUNCE_WINDOW)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}_{}", self.shared.prefix, key)
    }

    fn is_namespaced(&self, full_key: &str) -> bool {
        full_key
            .strip_prefix(&self.shared.prefix)
            .map(|rest| rest.starts_with('_'))
            .unwrap_or(false)
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, StoreState>> {
        self.shared
            .state
            .lock()
            .map_err(|e| LaneLinkError::Internal(e.to_string()))
    }

    /// Store `value` under `key`, tagged with `kind`.
    ///
    /// Checks current namespace usage against the quota first; if the write
    /// would exceed it, the oldest entries (by timestamp) are evicted until
    /// it fits. When eviction cannot free enough space the write fails with
    /// [`LaneLinkError::QuotaExceeded`] and nothing is modified.
    ///
    /// The physical write is debounced: rapid sets within the window
    /// coalesce into one backend persist. Call [`flush`](Self::flush) to
    /// force it.
    pub async fn set(&self, key: &str, value: JsonValue, kind: &str) -> Result<()> {
        let full = self.full_key(key);
        let entry = StoredEntry {
            value,
            timestamp: now_ms(),
            kind: kind.to_string(),
            version: ENTRY_FORMAT_VERSION.to_string(),
        };
        let needed = entry.approximate_size(&full);

        let schedule_flush = {
            let mut state = self.lock_state()?;

            let usage: usize = state
                .entries
                .iter()
                .filter(|(k, _)| self.is_namespaced(k) && **k != full)
                .map(|(k, e)| e.approximate_size(k))
                .sum();

            if usage + needed > self.shared.quota_bytes {
                // Evict oldest-first within our namespace until it fits.
                let mut candidates: Vec<(String, u64, usize)> = state
                    .entries
                    .iter()
                    .filter(|(k, _)| self.is_namespaced(k) && **k != full)
                    .map(|(k, e)| (k.clone(), e.timestamp, e.approximate_size(k)))
                    .collect();
                candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

                let mut freed = 0usize;
                let mut evict = Vec::new();
                for (k, _, size) in candidates {
                    if usage - freed + needed <= self.shared.quota_bytes {
                        break;
                    }
                    freed += size;
                    evict.push(k);
                }

                if usage - freed + needed > self.shared.quota_bytes {
                    let available = self.shared.quota_bytes.saturating_sub(usage - freed);
                    return Err(LaneLinkError::QuotaExceeded { needed, available });
                }

                for k in evict {
                    log::debug!("[lane-link] Store quota: evicting oldest entry '{}'", k);
                    state.entries.remove(&k);
                }
            }

            state.entries.insert(full, entry);
            state.dirty = true;

            if self.shared.debounce_window.is_zero() {
                false // persist inline below
            } else if state.flush_scheduled {
                false // a flush is already pending; this set rides along
            } else {
                state.flush_scheduled = true;
                true
            }
        };

        if self.shared.debounce_window.is_zero() {
            self.flush().await?;
        } else if schedule_flush {
            let store = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(store.shared.debounce_window).await;
                if let Err(e) = store.flush().await {
                    log::warn!("[lane-link] Debounced store flush failed: {}", e);
                }
            });
        }

        Ok(())
    }

    /// Retrieve the value stored under `key`, or `None` if absent.
    /// Never errors for a missing key.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.get_entry(key).map(|e| e.value)
    }

    /// Retrieve the full persisted entry under `key`.
    pub fn get_entry(&self, key: &str) -> Option<StoredEntry> {
        let full = self.full_key(key);
        let state = self.shared.state.lock().ok()?;
        state.entries.get(&full).cloned()
    }

    /// Remove the entry under `key`.
    ///
    /// Persists immediately and verifies the post-condition by re-reading
    /// the backend; verification failure is reported as a storage error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let full = self.full_key(key);
        let snapshot = {
            let mut state = self.lock_state()?;
            state.entries.remove(&full);
            state.dirty = false;
            state.entries.clone()
        };
        self.shared.backend.persist(&snapshot)?;

        let reloaded = self.shared.backend.load()?;
        if reloaded.contains_key(&full) {
            return Err(LaneLinkError::Storage(format!(
                "Removal of '{}' did not persist",
                key
            )));
        }
        Ok(())
    }

    /// Remove all entries in this namespace. Entries under other prefixes
    /// sharing the backend are untouched.
    ///
    /// Persists immediately and verifies the post-condition like
    /// [`remove`](Self::remove).
    pub async fn clear(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.lock_state()?;
            let keep: HashMap<String, StoredEntry> = state
                .entries
                .iter()
                .filter(|(k, _)| !self.is_namespaced(k))
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect();
            state.entries = keep;
            state.dirty = false;
            state.entries.clone()
        };
        self.shared.backend.persist(&snapshot)?;

        let reloaded = self.shared.backend.load()?;
        if reloaded.keys().any(|k| self.is_namespaced(k)) {
            return Err(LaneLinkError::Storage("Clear did not persist".to_string()));
        }
        Ok(())
    }

    /// Force any pending debounced write to the backend now.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.lock_state()?;
            state.flush_scheduled = false;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.entries.clone()
        };
        self.shared.backend.persist(&snapshot)
    }

    /// Approximate bytes currently used by this namespace.
    pub fn usage_bytes(&self) -> usize {
        let state = match self.shared.state.lock() {
            Ok(s) => s,
            Err(_) => return 0,
        };
        state
            .entries
            .iter()
            .filter(|(k, _)| self.is_namespaced(k))
            .map(|(k, e)| e.approximate_size(k))
            .sum()
    }

    /// Number of entries in this namespace.
    pub fn len(&self) -> usize {
        let state = match self.shared.state.lock() {
            Ok(s) => s,
            Err(_) => return 0,
        };
        state.entries.keys().filter(|k| self.is_namespaced(k)).count()
    }

    /// Whether this namespace holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to externally-made changes observed by
    /// [`poll_external`](Self::poll_external).
    pub fn subscribe_external(&self) -> broadcast::Receiver<ExternalChange> {
        self.shared.external_tx.subscribe()
    }

    /// Re-read the backend and adopt well-formed external changes into the
    /// in-memory mirror, emitting an [`ExternalChange`] per adopted key.
    ///
    /// Nothing is adopted while a local write is pending: the mirror is
    /// ahead of the disk snapshot then, and adopting it would revert the
    /// pending write (or mistake it for an external delete). The round
    /// after the flush catches up.
    pub async fn poll_external(&self) -> Result<()> {
        let disk = self.shared.backend.load()?;

        let changes = {
            let mut state = self.lock_state()?;
            if state.dirty {
                return Ok(());
            }
            let mut changes = Vec::new();

            for (k, entry) in disk.iter().filter(|(k, _)| self.is_namespaced(k)) {
                if state.entries.get(k) != Some(entry) {
                    state.entries.insert(k.clone(), entry.clone());
                    changes.push(ExternalChange {
                        key: k[self.shared.prefix.len() + 1..].to_string(),
                        value: Some(entry.value.clone()),
                    });
                }
            }

            let gone: Vec<String> = state
                .entries
                .keys()
                .filter(|k| self.is_namespaced(k) && !disk.contains_key(*k))
                .cloned()
                .collect();
            for k in gone {
                state.entries.remove(&k);
                changes.push(ExternalChange {
                    key: k[self.shared.prefix.len() + 1..].to_string(),
                    value: None,
                });
            }

            changes
        };

        for change in changes {
            log::debug!(
                "[lane-link] Adopted external store change for '{}'",
                change.key
            );
            let _ = self.shared.external_tx.send(change);
        }
        Ok(())
    }

    /// Spawn a background task polling for external changes on `interval`.
    /// Replaces any previous poller. Aborted on [`close`](Self::close) or
    /// when the last store clone drops.
    pub fn spawn_poller(&self, interval: Duration) {
        let store = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = store.poll_external().await {
                    log::warn!("[lane-link] External store poll failed: {}", e);
                }
            }
        });
        if let Ok(mut poller) = self.shared.poller.lock() {
            if let Some(old) = poller.replace(handle) {
                old.abort();
            }
        }
    }

    /// Flush pending writes and stop the external poller.
    pub async fn close(&self) -> Result<()> {
        if let Ok(mut poller) = self.shared.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
        self.flush().await
    }
}
