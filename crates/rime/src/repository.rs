//! Normalized entity repository.
//!
//! Stores entities keyed by `(model, canonical id)` and lists keyed by
//! `(model, canonical query)`, coordinates read-through fetches through a
//! [`Transport`], and notifies subscribers after every applied transition.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashSet;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::codec::{Id, encode_id, encode_query};
use crate::config::RepositoryConfig;
use crate::debounce::{PendingInserts, SlotKey};
use crate::error::{FetchError, TransportError};
use crate::normalize::normalize;
use crate::transport::Transport;
use crate::types::{Entity, ListResponse, Ref, Resource};

/// Result of a synchronous item cache read.
#[derive(Debug, Clone)]
pub enum ItemCache {
    /// The last fetch for this item failed.
    Failed(FetchError),
    /// The item was removed by an explicit deletion write.
    Deleted,
    /// Nothing stored yet.
    Missing { is_loading: bool },
    /// A stored entity, possibly being refetched.
    Cached { is_loading: bool, entity: Entity },
}

/// Result of a synchronous list cache read.
#[derive(Debug, Clone)]
pub enum ListCache {
    Failed(FetchError),
    Missing {
        is_loading: bool,
    },
    Cached {
        is_loading: bool,
        /// Set by an invalidating write; the list is still servable.
        has_invalid_cache: bool,
        items: Vec<Ref>,
        total_count: u64,
    },
}

/// One entry of an explicit write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemWrite {
    /// Store the resource, extracting any sideloads it carries.
    Upsert(Resource),
    /// Mark the slot deleted.
    Delete(Ref),
}

impl ItemWrite {
    pub fn upsert(resource: impl Into<Resource>) -> Self {
        ItemWrite::Upsert(resource.into())
    }

    pub fn delete(model: impl Into<String>, id: impl Into<Id>) -> Self {
        ItemWrite::Delete(Ref::new(model, id))
    }

    pub fn model(&self) -> &str {
        match self {
            ItemWrite::Upsert(resource) => &resource.model,
            ItemWrite::Delete(target) => &target.model,
        }
    }

    /// Canonical key of the written id.
    pub fn key(&self) -> String {
        match self {
            ItemWrite::Upsert(resource) => resource.key(),
            ItemWrite::Delete(target) => target.key(),
        }
    }
}

/// Notification sent after each applied transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RepositoryUpdate {
    /// Entities were written, by a flushed fetch batch or an explicit write.
    ItemsInserted {
        models: BTreeSet<String>,
        lists_invalidated: bool,
    },
    /// An item fetch failed.
    ItemFailed { model: String, key: String },
    /// A list fetch succeeded.
    ListInserted { model: String, query: String },
    /// A list fetch failed.
    ListFailed { model: String, query: String },
}

#[derive(Debug)]
enum EntitySlot {
    Present(Entity),
    Failed {
        error: FetchError,
        last_good: Option<Entity>,
    },
    Deleted,
}

#[derive(Debug, Clone)]
struct ListEntry {
    ids: Vec<Id>,
    total_count: u64,
    has_invalid_cache: bool,
}

#[derive(Debug)]
enum ListSlot {
    Present(ListEntry),
    Failed {
        error: FetchError,
        last_good: Option<ListEntry>,
    },
}

#[derive(Debug, Default)]
struct RepositoryState {
    entities: HashMap<String, HashMap<String, EntitySlot>>,
    lists: HashMap<String, HashMap<String, ListSlot>>,
}

impl RepositoryState {
    /// Store entities as present, returning the models touched.
    fn store_entities(&mut self, entities: Vec<Entity>) -> BTreeSet<String> {
        let mut models = BTreeSet::new();
        for entity in entities {
            models.insert(entity.model.clone());
            self.entities
                .entry(entity.model.clone())
                .or_default()
                .insert(entity.key(), EntitySlot::Present(entity));
        }
        models
    }
}

/// Shared, normalized cache of remote entities and lists.
pub struct Repository {
    transport: Arc<dyn Transport>,
    config: RepositoryConfig,
    state: RwLock<RepositoryState>,
    /// Item fetches in flight, by `(model, id key)`.
    loading_items: DashSet<SlotKey>,
    /// List fetches in flight, by `(model, query key)`.
    loading_lists: DashSet<SlotKey>,
    pending: Mutex<PendingInserts>,
    /// Number of applied transitions.
    generation: AtomicU64,
    updates_tx: broadcast::Sender<RepositoryUpdate>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl Repository {
    pub fn new(transport: Arc<dyn Transport>, config: RepositoryConfig) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(config.update_channel_capacity.max(1));
        Arc::new(Self {
            transport,
            config,
            state: RwLock::new(RepositoryState::default()),
            loading_items: DashSet::new(),
            loading_lists: DashSet::new(),
            pending: Mutex::new(PendingInserts::default()),
            generation: AtomicU64::new(0),
            updates_tx,
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Subscribe to repository updates.
    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryUpdate> {
        self.updates_tx.subscribe()
    }

    /// Number of transitions applied so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RepositoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RepositoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingInserts> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, update: RepositoryUpdate) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for repository update");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an item slot without fetching.
    pub fn get_item_cache(&self, model: &str, id: &Id) -> ItemCache {
        let key = encode_id(id);
        // In-flight flags are released after the state write, so checking
        // them first never reports a settled fetch as missing.
        let is_loading = self.loading_items.contains(&(model.to_string(), key.clone()));
        let state = self.read_state();
        match state.entities.get(model).and_then(|slots| slots.get(&key)) {
            None => ItemCache::Missing { is_loading },
            Some(EntitySlot::Present(entity)) => ItemCache::Cached {
                is_loading,
                entity: entity.clone(),
            },
            Some(EntitySlot::Failed { error, .. }) => ItemCache::Failed(Arc::clone(error)),
            Some(EntitySlot::Deleted) => ItemCache::Deleted,
        }
    }

    /// Read a list slot without fetching.
    pub fn get_list_cache(&self, model: &str, query: &Value) -> ListCache {
        let key = encode_query(query);
        let is_loading = self.loading_lists.contains(&(model.to_string(), key.clone()));
        let state = self.read_state();
        match state.lists.get(model).and_then(|slots| slots.get(&key)) {
            None => ListCache::Missing { is_loading },
            Some(ListSlot::Present(entry)) => ListCache::Cached {
                is_loading,
                has_invalid_cache: entry.has_invalid_cache,
                items: entry
                    .ids
                    .iter()
                    .map(|id| Ref::new(model, id.clone()))
                    .collect(),
                total_count: entry.total_count,
            },
            Some(ListSlot::Failed { error, .. }) => ListCache::Failed(Arc::clone(error)),
        }
    }

    /// Whether the item slot is marked deleted.
    pub fn is_deleted(&self, model: &str, key: &str) -> bool {
        matches!(
            self.read_state().entities.get(model).and_then(|slots| slots.get(key)),
            Some(EntitySlot::Deleted)
        )
    }

    /// The stored entity used as a reconciliation original.
    ///
    /// Falls back to the last good value of a failed slot. Deleted and
    /// unknown slots have no original.
    pub fn original(&self, model: &str, key: &str) -> Option<Entity> {
        match self.read_state().entities.get(model)?.get(key)? {
            EntitySlot::Present(entity) => Some(entity.clone()),
            EntitySlot::Failed { last_good, .. } => last_good.clone(),
            EntitySlot::Deleted => None,
        }
    }

    pub fn is_item_loading(&self, model: &str, id: &Id) -> bool {
        self.loading_items
            .contains(&(model.to_string(), encode_id(id)))
    }

    pub fn is_list_loading(&self, model: &str, query: &Value) -> bool {
        self.loading_lists
            .contains(&(model.to_string(), encode_query(query)))
    }

    // =========================================================================
    // Fetch coordination
    // =========================================================================

    /// Fetch an item in the background.
    ///
    /// Returns `None` when a fetch for the same `(model, id)` is already in
    /// flight; the transport is not called again.
    pub fn fetch_item(self: &Arc<Self>, model: &str, id: &Id) -> Option<JoinHandle<()>> {
        let slot: SlotKey = (model.to_string(), encode_id(id));
        if !self.loading_items.insert(slot.clone()) {
            trace!(model, key = %slot.1, "item fetch already in flight");
            return None;
        }

        let span = debug_span!("fetch_item", model, key = %slot.1);
        let repository = Arc::clone(self);
        let id = id.clone();
        Some(tokio::spawn(
            async move {
                debug!("fetching item");
                let result = repository.transport.read_item(&slot.0, &id).await;
                repository.settle_item(slot, id, result);
            }
            .instrument(span),
        ))
    }

    /// Fetch a list in the background, deduplicated like [`fetch_item`].
    ///
    /// [`fetch_item`]: Repository::fetch_item
    pub fn fetch_list(self: &Arc<Self>, model: &str, query: &Value) -> Option<JoinHandle<()>> {
        let slot: SlotKey = (model.to_string(), encode_query(query));
        if !self.loading_lists.insert(slot.clone()) {
            trace!(model, query = %slot.1, "list fetch already in flight");
            return None;
        }

        let span = debug_span!("fetch_list", model, query = %slot.1);
        let repository = Arc::clone(self);
        let query = query.clone();
        Some(tokio::spawn(
            async move {
                debug!("fetching list");
                let result = repository.transport.read_list(&slot.0, &query).await;
                repository.settle_list(slot, result);
            }
            .instrument(span),
        ))
    }

    fn settle_item(
        self: &Arc<Self>,
        slot: SlotKey,
        id: Id,
        result: Result<Resource, TransportError>,
    ) {
        match result {
            Ok(mut resource) => {
                // The root lands in the requested slot whatever id the
                // response carries; sideloads keep their own keys.
                if resource.model != slot.0 || resource.key() != slot.1 {
                    debug!(
                        returned_model = %resource.model,
                        returned_key = %resource.key(),
                        "response id differs from requested id"
                    );
                }
                resource.model = slot.0.clone();
                resource.id = id;
                let schedule = self.lock_pending().push(slot, resource);
                if schedule {
                    self.schedule_flush();
                }
            }
            Err(error) => {
                warn!(model = %slot.0, key = %slot.1, error = %error, "item fetch failed");
                {
                    let mut state = self.write_state();
                    let slots = state.entities.entry(slot.0.clone()).or_default();
                    let last_good = match slots.remove(&slot.1) {
                        Some(EntitySlot::Present(entity)) => Some(entity),
                        Some(EntitySlot::Failed { last_good, .. }) => last_good,
                        Some(EntitySlot::Deleted) | None => None,
                    };
                    slots.insert(
                        slot.1.clone(),
                        EntitySlot::Failed {
                            error: Arc::new(error),
                            last_good,
                        },
                    );
                }
                self.loading_items.remove(&slot);
                self.broadcast(RepositoryUpdate::ItemFailed {
                    model: slot.0,
                    key: slot.1,
                });
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let delay = self.config.insert_debounce();
        if delay.is_zero() {
            self.flush_pending_inserts();
            return;
        }
        let repository = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            repository.flush_pending_inserts();
        });
    }

    /// Apply every queued item fetch result as one transition.
    ///
    /// Returns the number of fetched resources applied. Called by the
    /// debounce timer; callers may flush early.
    pub fn flush_pending_inserts(&self) -> usize {
        // Held across the state write so an explicit write cannot land
        // between draining the batch and applying it.
        let mut pending = self.lock_pending();
        let (resources, settled) = pending.take();
        if resources.is_empty() {
            return 0;
        }

        let count = resources.len();
        let entities = normalize(resources);
        let models = self.write_state().store_entities(entities);
        drop(pending);
        for slot in &settled {
            self.loading_items.remove(slot);
        }
        debug!(count, ?models, "flushed item inserts");
        self.broadcast(RepositoryUpdate::ItemsInserted {
            models,
            lists_invalidated: false,
        });
        count
    }

    /// Number of fetched items waiting for the next flush.
    pub fn pending_inserts(&self) -> usize {
        self.lock_pending().len()
    }

    fn settle_list(&self, slot: SlotKey, result: Result<ListResponse, TransportError>) {
        match result {
            Ok(response) => {
                let ids: Vec<Id> = response.items.iter().map(|item| item.id.clone()).collect();
                let full = response
                    .items
                    .into_iter()
                    .filter(|item| !item.is_stub());
                let entities = normalize(full);
                {
                    let mut state = self.write_state();
                    state.store_entities(entities);
                    state.lists.entry(slot.0.clone()).or_default().insert(
                        slot.1.clone(),
                        ListSlot::Present(ListEntry {
                            ids,
                            total_count: response.total_count,
                            has_invalid_cache: false,
                        }),
                    );
                }
                self.loading_lists.remove(&slot);
                debug!(model = %slot.0, query = %slot.1, "list stored");
                self.broadcast(RepositoryUpdate::ListInserted {
                    model: slot.0,
                    query: slot.1,
                });
            }
            Err(error) => {
                warn!(model = %slot.0, query = %slot.1, error = %error, "list fetch failed");
                {
                    let mut state = self.write_state();
                    let slots = state.lists.entry(slot.0.clone()).or_default();
                    let last_good = match slots.remove(&slot.1) {
                        Some(ListSlot::Present(entry)) => Some(entry),
                        Some(ListSlot::Failed { last_good, .. }) => last_good,
                        None => None,
                    };
                    slots.insert(
                        slot.1.clone(),
                        ListSlot::Failed {
                            error: Arc::new(error),
                            last_good,
                        },
                    );
                }
                self.loading_lists.remove(&slot);
                self.broadcast(RepositoryUpdate::ListFailed {
                    model: slot.0,
                    query: slot.1,
                });
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply an explicit write batch as one transition.
    ///
    /// Upserts go through sideload normalization. A deletion holds unless a
    /// later upsert in the same batch targets the same slot. Queued fetch
    /// results for written slots are dropped, so the write wins. With
    /// `invalidate_involved_list_caches`, every stored list of a written
    /// model is flagged stale.
    pub fn insert_items(&self, writes: Vec<ItemWrite>, invalidate_involved_list_caches: bool) {
        if writes.is_empty() {
            return;
        }

        let mut last_is_delete: HashMap<SlotKey, bool> = HashMap::new();
        let mut upserts = Vec::new();
        let mut deletions = Vec::new();
        for write in writes {
            let slot = (write.model().to_string(), write.key());
            match write {
                ItemWrite::Upsert(resource) => {
                    last_is_delete.insert(slot, false);
                    upserts.push(resource);
                }
                ItemWrite::Delete(_) => {
                    last_is_delete.insert(slot.clone(), true);
                    deletions.push(slot);
                }
            }
        }

        let written: HashSet<SlotKey> = last_is_delete.keys().cloned().collect();
        let mut pending = self.lock_pending();
        let superseded = pending.discard(&written);
        if !superseded.is_empty() {
            debug!(count = superseded.len(), "dropped queued fetch results superseded by write");
        }

        let entities = normalize(upserts);
        let models = {
            let mut state = self.write_state();
            let mut models = state.store_entities(entities);
            for (model, key) in deletions {
                if last_is_delete.get(&(model.clone(), key.clone())) == Some(&true) {
                    state
                        .entities
                        .entry(model.clone())
                        .or_default()
                        .insert(key, EntitySlot::Deleted);
                }
                models.insert(model);
            }

            if invalidate_involved_list_caches {
                for model in &models {
                    let Some(lists) = state.lists.get_mut(model) else {
                        continue;
                    };
                    for list in lists.values_mut() {
                        if let ListSlot::Present(entry) = list {
                            entry.has_invalid_cache = true;
                        }
                    }
                }
            }
            models
        };
        drop(pending);
        for slot in &superseded {
            self.loading_items.remove(slot);
        }

        debug!(
            ?models,
            invalidate = invalidate_involved_list_caches,
            "inserted items"
        );
        self.broadcast(RepositoryUpdate::ItemsInserted {
            models,
            lists_invalidated: invalidate_involved_list_caches,
        });
    }
}
