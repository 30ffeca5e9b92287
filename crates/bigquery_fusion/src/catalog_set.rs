//! Lazily loaded, lock-guarded mirror of one remote namespace.
//!
//! A [`CatalogSet`] maps case-insensitive names to shared descriptors. The
//! remote listing API is cheap per namespace and expensive per entry, so the
//! first miss loads the whole namespace in bulk; later misses are plain
//! "not found" until [`CatalogSet::clear_entries`] starts a new load cycle.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{BigQueryError, Result};
use crate::metrics::BridgeMetrics;

/// Descriptor stored in a [`CatalogSet`].
pub trait CatalogEntry: Send + Sync + 'static {
    /// Name the entry is looked up by (compared case-insensitively).
    fn name(&self) -> &str;
}

/// Bulk loader for one namespace.
#[async_trait]
pub trait EntryLoader<E>: Send + Sync {
    /// Lists every entry of the namespace.
    async fn load_entries(&self) -> anyhow::Result<Vec<E>>;

    /// Human-readable namespace label used in logs and errors.
    fn namespace(&self) -> String;
}

struct CatalogSetState<E> {
    entries: HashMap<String, Arc<E>>,
    is_loaded: bool,
}

/// Monitor object: one mutex guards both the map and the loaded flag.
pub struct CatalogSet<E> {
    loader: Arc<dyn EntryLoader<E>>,
    state: Mutex<CatalogSetState<E>>,
    metrics: Arc<BridgeMetrics>,
}

fn entry_key(name: &str) -> String {
    name.to_lowercase()
}

impl<E: CatalogEntry> CatalogSet<E> {
    /// Creates an empty, unloaded set.
    pub fn new(loader: Arc<dyn EntryLoader<E>>, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            loader,
            state: Mutex::new(CatalogSetState {
                entries: HashMap::new(),
                is_loaded: false,
            }),
            metrics,
        }
    }

    /// Namespace label of the underlying loader.
    pub fn namespace(&self) -> String {
        self.loader.namespace()
    }

    /// Looks up an entry, bulk-loading the namespace on a miss while unloaded.
    pub async fn get_entry(&self, name: &str) -> Result<Option<Arc<E>>> {
        let key = entry_key(name);
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get(&key) {
            return Ok(Some(Arc::clone(entry)));
        }
        // Decision: a miss after loading is authoritative; only invalidation
        // starts another load cycle.
        if state.is_loaded {
            return Ok(None);
        }
        self.load_locked(&mut state).await?;
        Ok(state.entries.get(&key).cloned())
    }

    /// Ensures the set is loaded, then calls `callback` once per entry.
    ///
    /// No ordering is guaranteed. The lock is held while the callback runs,
    /// so callbacks must not call back into this set.
    pub async fn scan<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Arc<E>),
    {
        let mut state = self.state.lock().await;
        if !state.is_loaded {
            self.load_locked(&mut state).await?;
        }
        for entry in state.entries.values() {
            callback(entry);
        }
        Ok(())
    }

    /// Collects every entry, loading the namespace first when needed.
    pub async fn entries(&self) -> Result<Vec<Arc<E>>> {
        let mut out = Vec::new();
        self.scan(|entry| out.push(Arc::clone(entry))).await?;
        Ok(out)
    }

    /// Inserts a new entry; returns `None` without mutating when the name is taken.
    pub async fn create_entry(&self, entry: E) -> Option<Arc<E>> {
        let key = entry_key(entry.name());
        let mut state = self.state.lock().await;
        match state.entries.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(Arc::clone(slot.insert(Arc::new(entry)))),
        }
    }

    /// Stores `entry`, overwriting a cached entry of the same name.
    ///
    /// Used after a targeted re-fetch; it never starts a load cycle.
    pub async fn replace_entry(&self, entry: E) -> Arc<E> {
        let entry = Arc::new(entry);
        let mut state = self.state.lock().await;
        state
            .entries
            .insert(entry_key(entry.name()), Arc::clone(&entry));
        entry
    }

    /// Removes an entry; `None` means the name was not cached.
    pub async fn drop_entry(&self, name: &str) -> Option<Arc<E>> {
        let mut state = self.state.lock().await;
        state.entries.remove(&entry_key(name))
    }

    /// Forgets every entry and forces the next access to reload.
    pub async fn clear_entries(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.is_loaded = false;
    }

    /// Whether the current load cycle has completed.
    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.is_loaded
    }

    async fn load_locked(&self, state: &mut CatalogSetState<E>) -> Result<()> {
        let namespace = self.loader.namespace();
        // Decision: a failed load leaves `is_loaded` false so the next access
        // retries instead of caching an empty namespace.
        let loaded = self
            .loader
            .load_entries()
            .await
            .map_err(|err| BigQueryError::remote(&format!("load {namespace}"), err))?;
        self.metrics.record_namespace_load();

        let total = loaded.len();
        for entry in loaded {
            match state.entries.entry(entry_key(entry.name())) {
                Entry::Occupied(existing) => {
                    warn!(
                        namespace = %namespace,
                        name = entry.name(),
                        kept = existing.get().name(),
                        "keeping already cached entry over listed duplicate"
                    );
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(entry));
                }
            }
        }
        state.is_loaded = true;
        info!(namespace = %namespace, entries = total, "loaded remote namespace");
        Ok(())
    }
}
