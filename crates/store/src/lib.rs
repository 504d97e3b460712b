//! Tabula in-RAM stores: row collection, per-row status, and selection.
//!
//! Mutations are synchronous batches; each batch publishes one epoch bump on
//! a watch channel so UI readers re-render from store state. Every mutating
//! call carries a `source` tag that shows up in the logs.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tabula_core::{ItemKey, ItemStatus, ListRow};
use tokio::sync::watch;
use tracing::{debug, warn};

fn epoch_channel() -> watch::Sender<u64> {
    let (tx, _) = watch::channel(0u64);
    tx
}

fn bump(tx: &watch::Sender<u64>) {
    tx.send_modify(|epoch| *epoch += 1);
}

/// Authoritative row collection, keyed by item key.
///
/// Readers take lock-free snapshots; writers serialize through a mutex and
/// publish a fresh snapshot per batch (read-copy-update).
pub struct ItemStore {
    rows: ArcSwap<FxHashMap<ItemKey, ListRow>>,
    write: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for ItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemStore {
    pub fn new() -> Self {
        Self {
            rows: ArcSwap::from_pointee(FxHashMap::default()),
            write: Mutex::new(()),
            epoch_tx: epoch_channel(),
        }
    }

    pub fn get_item(&self, key: &str) -> Option<ListRow> {
        self.rows.load().get(key).cloned()
    }

    pub fn item_key(&self, row: &ListRow) -> Option<ItemKey> {
        row.key()
    }

    /// Current snapshot for readers; unaffected by later writes.
    pub fn snapshot(&self) -> Arc<FxHashMap<ItemKey, ListRow>> {
        self.rows.load_full()
    }

    pub fn len(&self) -> usize {
        self.rows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.load().is_empty()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Upsert a batch of rows. Rows without an identity are dropped with a
    /// warning.
    pub fn update_items(&self, source: &str, rows: Vec<ListRow>) {
        self.insert_rows(source, rows, "store: items updated");
    }

    /// Insert rows arriving through the new-item path (created rows landing
    /// for the first time). Same upsert semantics, distinct notification
    /// source for subscribers that care where a row came from.
    pub fn add_new_items(&self, source: &str, rows: Vec<ListRow>) {
        self.insert_rows(source, rows, "store: items added");
    }

    fn insert_rows(&self, source: &str, rows: Vec<ListRow>, msg: &'static str) {
        if rows.is_empty() {
            return;
        }
        let guard = self.write.lock().unwrap();
        let mut next = (**self.rows.load()).clone();
        let mut applied = 0usize;
        for row in rows {
            match row.key() {
                Some(key) => {
                    next.insert(key, row);
                    applied += 1;
                }
                None => warn!(source, "store: dropping row without identity"),
            }
        }
        if applied > 0 {
            self.rows.store(Arc::new(next));
            bump(&self.epoch_tx);
        }
        drop(guard);
        debug!(source, count = applied, "{}", msg);
    }

    pub fn delete_items(&self, source: &str, keys: &[ItemKey]) {
        if keys.is_empty() {
            return;
        }
        let guard = self.write.lock().unwrap();
        let mut next = (**self.rows.load()).clone();
        let mut removed = 0usize;
        for key in keys {
            if next.remove(key).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.rows.store(Arc::new(next));
            bump(&self.epoch_tx);
        }
        drop(guard);
        debug!(source, count = removed, "store: items deleted");
    }
}

/// One status-store update entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub item_key: ItemKey,
    pub status: ItemStatus,
}

impl StatusUpdate {
    pub fn new(item_key: impl Into<ItemKey>, status: ItemStatus) -> Self {
        Self { item_key: item_key.into(), status }
    }
}

/// Transient per-row status, keyed by item key. Entries are whole values:
/// an update overwrites the entry, callers read-modify-write.
pub struct ItemStatusStore {
    statuses: RwLock<FxHashMap<ItemKey, ItemStatus>>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for ItemStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemStatusStore {
    pub fn new() -> Self {
        Self { statuses: RwLock::new(FxHashMap::default()), epoch_tx: epoch_channel() }
    }

    pub fn get_status(&self, key: &str) -> Option<ItemStatus> {
        self.statuses.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.statuses.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.read().unwrap().is_empty()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn update_statuses(&self, source: &str, updates: Vec<StatusUpdate>) {
        if updates.is_empty() {
            return;
        }
        let count = updates.len();
        {
            let mut statuses = self.statuses.write().unwrap();
            for update in updates {
                statuses.insert(update.item_key, update.status);
            }
        }
        bump(&self.epoch_tx);
        debug!(source, count, "store: statuses updated");
    }

    /// Remove converged entries. Absent keys are no-ops.
    pub fn delete_statuses(&self, keys: &[ItemKey]) {
        if keys.is_empty() {
            return;
        }
        let removed = {
            let mut statuses = self.statuses.write().unwrap();
            keys.iter().filter(|key| statuses.remove(*key).is_some()).count()
        };
        if removed > 0 {
            bump(&self.epoch_tx);
        }
        debug!(count = removed, "store: statuses deleted");
    }
}

/// Currently selected row keys.
pub struct SelectionStore {
    selected: RwLock<FxHashSet<ItemKey>>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for SelectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStore {
    pub fn new() -> Self {
        Self { selected: RwLock::new(FxHashSet::default()), epoch_tx: epoch_channel() }
    }

    pub fn is_selected(&self, key: &str) -> bool {
        self.selected.read().unwrap().contains(key)
    }

    /// Selected keys in stable order.
    pub fn selected(&self) -> Vec<ItemKey> {
        let mut keys: Vec<ItemKey> = self.selected.read().unwrap().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.selected.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.read().unwrap().is_empty()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn select(&self, source: &str, keys: &[ItemKey]) {
        if keys.is_empty() {
            return;
        }
        let added = {
            let mut selected = self.selected.write().unwrap();
            keys.iter().filter(|key| selected.insert((*key).clone())).count()
        };
        if added > 0 {
            bump(&self.epoch_tx);
        }
        debug!(source, count = added, "store: selection added");
    }

    pub fn remove(&self, source: &str, keys: &[ItemKey]) {
        if keys.is_empty() {
            return;
        }
        let removed = {
            let mut selected = self.selected.write().unwrap();
            keys.iter().filter(|key| selected.remove(*key)).count()
        };
        if removed > 0 {
            bump(&self.epoch_tx);
        }
        debug!(source, count = removed, "store: selection removed");
    }

    pub fn clear(&self, source: &str) {
        let removed = {
            let mut selected = self.selected.write().unwrap();
            let n = selected.len();
            selected.clear();
            n
        };
        if removed > 0 {
            bump(&self.epoch_tx);
        }
        debug!(source, count = removed, "store: selection cleared");
    }
}
