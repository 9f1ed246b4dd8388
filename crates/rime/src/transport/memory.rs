//! Fixture-backed transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::Transport;
use crate::codec::{Id, encode_id, encode_query};
use crate::error::TransportError;
use crate::types::{ListResponse, Resource};

/// Serialized fixture loaded by [`MemoryTransport::from_json`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Items served by `read_item`, and by default list reads of their model.
    #[serde(default)]
    pub items: Vec<Resource>,

    /// Explicit list responses keyed by model and query.
    #[serde(default)]
    pub lists: Vec<ListFixture>,
}

/// One explicit list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListFixture {
    pub model: String,
    #[serde(default)]
    pub query: Value,
    pub items: Vec<Resource>,
    /// Defaults to the number of items.
    #[serde(default, rename = "totalCount")]
    pub total_count: Option<u64>,
}

/// In-memory [`Transport`] with per-model read counters and injectable
/// failures.
///
/// Without an explicit list, a list read returns every item of the model in
/// insertion order, as stubs unless [`with_embedded_lists`] is set.
///
/// [`with_embedded_lists`]: MemoryTransport::with_embedded_lists
#[derive(Debug, Default)]
pub struct MemoryTransport {
    items: DashMap<String, Vec<Resource>>,
    lists: DashMap<(String, String), ListResponse>,
    item_failures: DashMap<(String, String), String>,
    list_failures: DashMap<(String, String), String>,
    item_reads: DashMap<String, usize>,
    list_reads: DashMap<String, usize>,
    embed_list_items: AtomicBool,
    latency: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every read, so callers can observe in-flight state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Serve full resources instead of stubs from default list reads.
    pub fn with_embedded_lists(self, embedded: bool) -> Self {
        self.embed_list_items.store(embedded, Ordering::SeqCst);
        self
    }

    pub fn from_fixture(fixture: Fixture) -> Self {
        let transport = Self::new();
        for item in fixture.items {
            transport.insert(item);
        }
        for list in fixture.lists {
            let total_count = list.total_count.unwrap_or(list.items.len() as u64);
            transport.set_list(&list.model, &list.query, list.items, total_count);
        }
        transport
    }

    /// Parse a JSON [`Fixture`].
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let fixture: Fixture = serde_json::from_str(json)?;
        Ok(Self::from_fixture(fixture))
    }

    /// Add or replace an item.
    pub fn insert(&self, resource: impl Into<Resource>) {
        let resource = resource.into();
        let key = resource.key();
        let mut items = self.items.entry(resource.model.clone()).or_default();
        match items.iter().position(|existing| existing.key() == key) {
            Some(index) => items[index] = resource,
            None => items.push(resource),
        }
    }

    /// Remove an item, as if it was deleted on the server.
    pub fn remove(&self, model: &str, id: &Id) -> bool {
        let key = encode_id(id);
        let Some(mut items) = self.items.get_mut(model) else {
            return false;
        };
        let before = items.len();
        items.retain(|item| item.key() != key);
        items.len() != before
    }

    /// Serve a fixed response for one `(model, query)`.
    pub fn set_list(&self, model: &str, query: &Value, items: Vec<Resource>, total_count: u64) {
        self.lists.insert(
            (model.to_string(), encode_query(query)),
            ListResponse { items, total_count },
        );
    }

    /// Make reads of this item fail until [`clear_failures`] is called.
    ///
    /// [`clear_failures`]: MemoryTransport::clear_failures
    pub fn fail_item(&self, model: &str, id: &Id, reason: impl Into<String>) {
        self.item_failures
            .insert((model.to_string(), encode_id(id)), reason.into());
    }

    /// Make reads of this list fail until [`clear_failures`] is called.
    ///
    /// [`clear_failures`]: MemoryTransport::clear_failures
    pub fn fail_list(&self, model: &str, query: &Value, reason: impl Into<String>) {
        self.list_failures
            .insert((model.to_string(), encode_query(query)), reason.into());
    }

    pub fn clear_failures(&self) {
        self.item_failures.clear();
        self.list_failures.clear();
    }

    /// Item reads issued for a model, failed ones included.
    pub fn item_reads(&self, model: &str) -> usize {
        self.item_reads.get(model).map_or(0, |count| *count)
    }

    /// List reads issued for a model, failed ones included.
    pub fn list_reads(&self, model: &str) -> usize {
        self.list_reads.get(model).map_or(0, |count| *count)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_list(&self, model: &str, query: &Value) -> Result<ListResponse, TransportError> {
        *self.list_reads.entry(model.to_string()).or_default() += 1;
        self.delay().await;

        let slot = (model.to_string(), encode_query(query));
        trace!(model, query = %slot.1, "memory list read");
        if let Some(reason) = self.list_failures.get(&slot) {
            return Err(TransportError::Rejected(reason.clone()));
        }
        if let Some(response) = self.lists.get(&slot) {
            return Ok(response.clone());
        }

        let items = self
            .items
            .get(model)
            .ok_or_else(|| TransportError::UnknownModel(model.to_string()))?;
        let embed = self.embed_list_items.load(Ordering::SeqCst);
        let items: Vec<Resource> = items
            .iter()
            .map(|item| {
                if embed {
                    item.clone()
                } else {
                    Resource::stub(item.model.clone(), item.id.clone())
                }
            })
            .collect();
        Ok(ListResponse {
            total_count: items.len() as u64,
            items,
        })
    }

    async fn read_item(&self, model: &str, id: &Id) -> Result<Resource, TransportError> {
        *self.item_reads.entry(model.to_string()).or_default() += 1;
        self.delay().await;

        let key = encode_id(id);
        trace!(model, key = %key, "memory item read");
        if let Some(reason) = self.item_failures.get(&(model.to_string(), key.clone())) {
            return Err(TransportError::Rejected(reason.clone()));
        }

        let items = self
            .items
            .get(model)
            .ok_or_else(|| TransportError::UnknownModel(model.to_string()))?;
        items
            .iter()
            .find(|item| item.key() == key)
            .cloned()
            .ok_or_else(|| TransportError::NotFound {
                model: model.to_string(),
                key,
            })
    }
}
