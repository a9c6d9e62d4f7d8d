// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable local state.
//!
//! Everything the service needs to survive a restart (stability counters,
//! unsent logs, the saved environment) is stored as JSON values under flat
//! dotted keys. Two backends are provided: a sled tree on disk and a shared
//! in-memory map for tests and ephemeral runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use sled::{Config as SledConfig, Db, Tree};
use tracing::{debug, error};

use crate::constants::LOCAL_STATE_TREE;
use crate::errors::StoreError;

/// Keys of the values kept in local state.
pub mod keys {
    pub const STABILITY_EXITED_CLEANLY: &str = "stability.exited_cleanly";
    pub const STABILITY_EXECUTION_PHASE: &str = "stability.execution_phase";
    pub const STABILITY_SESSION_END_COMPLETED: &str = "stability.session_end_completed";
    pub const STABILITY_LAUNCH_COUNT: &str = "stability.launch_count";
    pub const STABILITY_CRASH_COUNT: &str = "stability.crash_count";
    pub const STABILITY_INCOMPLETE_SESSION_END_COUNT: &str =
        "stability.incomplete_session_end_count";
    pub const STABILITY_BREAKPAD_REGISTRATION_SUCCESS: &str =
        "stability.breakpad_registration_success";
    pub const STABILITY_BREAKPAD_REGISTRATION_FAIL: &str = "stability.breakpad_registration_fail";
    pub const STABILITY_DEBUGGER_PRESENT: &str = "stability.debugger_present";
    pub const STABILITY_DEBUGGER_NOT_PRESENT: &str = "stability.debugger_not_present";
    pub const STABILITY_LAUNCH_TIME_SEC: &str = "stability.launch_time_sec";
    pub const STABILITY_LAST_TIMESTAMP_SEC: &str = "stability.last_timestamp_sec";
    pub const STABILITY_STATS_VERSION: &str = "stability.stats_version";
    pub const STABILITY_SAVED_ENVIRONMENT: &str = "stability.saved_environment";
    pub const STABILITY_SAVED_ENVIRONMENT_HASH: &str = "stability.saved_environment_hash";

    pub const METRICS_CLIENT_ID: &str = "metrics.client_id";
    pub const METRICS_SESSION_ID: &str = "metrics.session_id";
    pub const METRICS_INITIAL_LOGS: &str = "metrics.initial_logs";
    pub const METRICS_ONGOING_LOGS: &str = "metrics.ongoing_logs";

    pub const UNINSTALL_LAUNCH_COUNT: &str = "uninstall.launch_count";
    pub const UNINSTALL_METRICS_UPTIME_SEC: &str = "uninstall.metrics_uptime_sec";
}

/// Backend for durable key/value state.
pub trait PrefStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// Forces pending writes to durable storage.
    fn commit(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct InMemoryInner {
    values: BTreeMap<String, Value>,
    commits: usize,
}

/// In-memory store. Clones share the same underlying map, so a test can keep
/// a handle and inspect what the service wrote.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPrefStore {
    inner: Arc<Mutex<InMemoryInner>>,
}

impl InMemoryPrefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times [`PrefStore::commit`] was called.
    pub fn commit_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commits
    }
}

impl PrefStore for InMemoryPrefStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.values.remove(key);
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.commits += 1;
        Ok(())
    }
}

/// Sled-backed store persisting local state across restarts.
#[derive(Debug, Clone)]
pub struct SledPrefStore {
    db: Db,
    tree: Tree,
    path: PathBuf,
}

impl SledPrefStore {
    /// Opens (or creates) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }

        let db = SledConfig::new().path(&path).open()?;
        let tree = db.open_tree(LOCAL_STATE_TREE)?;
        debug!("Opened local state store at {}", path.display());
        Ok(Self { db, tree, path })
    }

    /// Opens a store that lives only as long as the process.
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        let tree = db.open_tree(LOCAL_STATE_TREE)?;
        Ok(Self {
            db,
            tree,
            path: PathBuf::new(),
        })
    }

    /// Returns the filesystem path backing the store.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PrefStore for SledPrefStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&value)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Typed access to local state.
///
/// Storage failures are logged and otherwise ignored: losing a counter is
/// preferable to stopping the service.
pub struct LocalState {
    store: Box<dyn PrefStore>,
}

impl LocalState {
    pub fn new(store: Box<dyn PrefStore>) -> Self {
        Self { store }
    }

    fn get(&self, key: &str) -> Option<Value> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to read local state key {}: {}", key, e);
                None
            }
        }
    }

    fn set(&mut self, key: &str, value: Value) {
        if let Err(e) = self.store.set(key, value) {
            error!("Failed to write local state key {}: {}", key, e);
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_list(&self, key: &str) -> Option<Vec<Value>> {
        match self.get(key) {
            Some(Value::Array(list)) => Some(list),
            _ => None,
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, Value::Bool(value));
    }

    pub fn set_i64(&mut self, key: &str, value: i64) {
        self.set(key, Value::from(value));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, Value::String(value.to_string()));
    }

    pub fn set_list(&mut self, key: &str, value: Vec<Value>) {
        self.set(key, Value::Array(value));
    }

    /// Adds one to an integer value, treating a missing value as zero.
    pub fn increment(&mut self, key: &str) {
        let value = self.get_i64(key, 0);
        self.set_i64(key, value.saturating_add(1));
    }

    /// Returns the integer value and resets it to zero.
    pub fn take_i64(&mut self, key: &str) -> i64 {
        let value = self.get_i64(key, 0);
        if value != 0 {
            self.set_i64(key, 0);
        }
        value
    }

    pub fn clear(&mut self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            error!("Failed to remove local state key {}: {}", key, e);
        }
    }

    pub fn commit(&mut self) {
        if let Err(e) = self.store.commit() {
            error!("Failed to commit local state: {}", e);
        }
    }
}

impl std::fmt::Debug for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalState").finish_non_exhaustive()
    }
}
