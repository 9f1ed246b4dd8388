//! Optimistic edit branches.
//!
//! A branch reads through a shared [`Repository`] and overlays its own
//! change log on top. Entries stay private to the branch until a merge or
//! push writes them into the repository.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::codec::{Id, encode_id, encode_query};
use crate::error::CacheError;
use crate::repository::{ItemCache, ListCache, Repository};
use crate::types::{Attributes, Entity, Ref, Relationships};

/// Payload of a change-log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Attributes(Attributes),
    Relationships(Relationships),
}

/// One committed edit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub model: String,
    pub id: Id,
    /// Canonical key of `id`.
    pub key: String,
    pub change: FieldChange,
}

/// An item as seen through a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemView {
    pub is_loading: bool,
    /// `None` until the first fetch lands.
    pub item: Option<Entity>,
}

/// A list as seen through a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ListView {
    pub is_loading: bool,
    /// Server order, with deleted items filtered out.
    pub items: Vec<Ref>,
    /// As last reported by the server.
    pub total_count: u64,
}

/// Notification sent when the change log changes.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchUpdate {
    Committed { model: String, key: String },
    ChangelogReset { removed: usize },
}

/// An isolated overlay of uncommitted edits.
pub struct Branch {
    repository: Arc<Repository>,
    change_log: RwLock<Vec<ChangeEntry>>,
    updates_tx: broadcast::Sender<BranchUpdate>,
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("change_log", &self.read_log().len())
            .finish_non_exhaustive()
    }
}

impl Branch {
    pub fn new(repository: Arc<Repository>) -> Arc<Self> {
        let capacity = repository.config().update_channel_capacity.max(1);
        let (updates_tx, _) = broadcast::channel(capacity);
        Arc::new(Self {
            repository,
            change_log: RwLock::new(Vec::new()),
            updates_tx,
        })
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    /// Subscribe to change-log updates.
    ///
    /// Repository transitions are published on
    /// [`Repository::subscribe`].
    pub fn subscribe(&self) -> broadcast::Receiver<BranchUpdate> {
        self.updates_tx.subscribe()
    }

    fn read_log(&self) -> RwLockReadGuard<'_, Vec<ChangeEntry>> {
        self.change_log.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_log(&self) -> RwLockWriteGuard<'_, Vec<ChangeEntry>> {
        self.change_log.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, update: BranchUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for branch update");
        }
    }

    /// Snapshot of the change log in append order.
    pub fn change_log(&self) -> Vec<ChangeEntry> {
        self.read_log().clone()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an item with this branch's edits applied.
    ///
    /// Starts a fetch when nothing is stored and none is in flight, so it
    /// must be called from within a Tokio runtime.
    pub fn get_item(&self, model: &str, id: &Id) -> Result<ItemView, CacheError> {
        match self.repository.get_item_cache(model, id) {
            ItemCache::Failed(source) => Err(CacheError::Fetch {
                model: model.to_string(),
                key: encode_id(id),
                source,
            }),
            ItemCache::Deleted => Err(CacheError::Deleted {
                model: model.to_string(),
                key: encode_id(id),
            }),
            ItemCache::Cached { is_loading, entity } => Ok(ItemView {
                is_loading,
                item: Some(self.overlay(entity, id)),
            }),
            ItemCache::Missing { is_loading } => {
                if !is_loading {
                    self.repository.fetch_item(model, id);
                }
                Ok(ItemView {
                    is_loading: true,
                    item: None,
                })
            }
        }
    }

    /// Apply log entries for this item in order; later fields win.
    fn overlay(&self, mut entity: Entity, id: &Id) -> Entity {
        let key = encode_id(id);
        for entry in self
            .read_log()
            .iter()
            .filter(|entry| entry.model == entity.model && entry.key == key)
        {
            match &entry.change {
                FieldChange::Attributes(attributes) => {
                    entity.attributes.extend(attributes.clone());
                }
                FieldChange::Relationships(relationships) => {
                    entity.relationships.extend(relationships.clone());
                }
            }
        }
        entity.id = id.clone();
        entity
    }

    /// Read a list through the repository.
    ///
    /// A stale list is still served, and a refetch starts unless one is
    /// already in flight.
    pub fn get_list(&self, model: &str, query: &Value) -> Result<ListView, CacheError> {
        match self.repository.get_list_cache(model, query) {
            ListCache::Failed(source) => Err(CacheError::Fetch {
                model: model.to_string(),
                key: encode_query(query),
                source,
            }),
            ListCache::Cached {
                mut is_loading,
                has_invalid_cache,
                items,
                total_count,
            } => {
                if has_invalid_cache && !is_loading {
                    debug!(model, "serving stale list while refetching");
                    is_loading = true;
                    self.repository.fetch_list(model, query);
                }
                let items = items
                    .into_iter()
                    .filter(|item| !self.repository.is_deleted(&item.model, &item.key()))
                    .collect();
                Ok(ListView {
                    is_loading,
                    items,
                    total_count,
                })
            }
            ListCache::Missing { is_loading } => {
                if !is_loading {
                    self.repository.fetch_list(model, query);
                }
                Ok(ListView {
                    is_loading: true,
                    items: Vec::new(),
                    total_count: 0,
                })
            }
        }
    }

    // =========================================================================
    // Edits
    // =========================================================================

    /// Record an attribute edit.
    ///
    /// Fails with [`CacheError::Unbound`] when no item is bound, leaving the
    /// log untouched.
    pub fn commit_attributes(
        &self,
        model: &str,
        id: Option<&Id>,
        attributes: Attributes,
    ) -> Result<(), CacheError> {
        let id = id.ok_or_else(|| CacheError::Unbound {
            model: model.to_string(),
        })?;
        self.append(model, id, FieldChange::Attributes(attributes));
        Ok(())
    }

    /// Record a relationship edit. Payloads hold stubs only.
    pub fn commit_relationships(
        &self,
        model: &str,
        id: Option<&Id>,
        relationships: Relationships,
    ) -> Result<(), CacheError> {
        let id = id.ok_or_else(|| CacheError::Unbound {
            model: model.to_string(),
        })?;
        self.append(model, id, FieldChange::Relationships(relationships));
        Ok(())
    }

    fn append(&self, model: &str, id: &Id, change: FieldChange) {
        let key = encode_id(id);
        self.write_log().push(ChangeEntry {
            model: model.to_string(),
            id: id.clone(),
            key: key.clone(),
            change,
        });
        trace!(model, key = %key, "edit committed to branch");
        self.broadcast(BranchUpdate::Committed {
            model: model.to_string(),
            key,
        });
    }

    /// Drop every entry whose `(model, key)` is listed.
    ///
    /// Returns the number of entries removed.
    pub fn reset_changelog(&self, keys_by_model: &BTreeMap<String, BTreeSet<String>>) -> usize {
        let removed = {
            let mut log = self.write_log();
            let before = log.len();
            log.retain(|entry| {
                !keys_by_model
                    .get(&entry.model)
                    .is_some_and(|keys| keys.contains(&entry.key))
            });
            before - log.len()
        };
        debug!(removed, "change log reset");
        self.broadcast(BranchUpdate::ChangelogReset { removed });
        removed
    }
}
