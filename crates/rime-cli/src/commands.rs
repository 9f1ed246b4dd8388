//! Subcommand implementations.
//!
//! Every command reads through a fresh branch and waits on repository
//! updates until the data it needs has settled.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use miette::{Result, miette};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use rime::{
    Attributes, Branch, CacheError, Entity, HttpTransport, Id, List, MemoryTransport, Merge, Push,
    Reduce, Repository, RepositoryConfig, Transport, encode_id, encode_query,
};

/// What `edit` does with the pending changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditMode {
    /// Only report the changes view.
    Preview,
    Merge,
    Push,
}

/// Load repository configuration, applying a flag override on top.
pub fn load_config(path: Option<&Path>, insert_debounce_ms: Option<u64>) -> Result<RepositoryConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| miette!("failed to read config {}: {}", path.display(), e))?;
            RepositoryConfig::from_json(&text).map_err(|e| miette!("{}", e))?
        }
        None => RepositoryConfig::default(),
    };
    if let Some(ms) = insert_debounce_ms {
        config = config.with_insert_debounce_ms(ms);
    }
    config.validate().map_err(|e| miette!("{}", e))?;
    Ok(config)
}

/// Build a transport from either a fixture file or a base URL.
pub fn load_transport(fixture: Option<&Path>, base_url: Option<&str>) -> Result<Arc<dyn Transport>> {
    match (fixture, base_url) {
        (Some(path), _) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| miette!("failed to read fixture {}: {}", path.display(), e))?;
            let transport = MemoryTransport::from_json(&text)
                .map_err(|e| miette!("invalid fixture {}: {}", path.display(), e))?;
            Ok(Arc::new(transport))
        }
        (None, Some(url)) => {
            let transport = HttpTransport::new(url).map_err(|e| miette!("{}", e))?;
            Ok(Arc::new(transport))
        }
        (None, None) => Err(miette!("either --fixture or --base-url is required")),
    }
}

/// Parse an id argument. Anything that is not valid JSON is a string id.
pub fn parse_id(raw: &str) -> Result<Id> {
    let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Id::try_from(&value).map_err(|e| miette!("{}", e))
}

pub fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| miette!("invalid {} JSON: {}", what, e))
}

pub fn id_key(raw: &str) -> Result<String> {
    Ok(encode_id(&parse_id(raw)?))
}

pub fn query_key(raw: &str) -> Result<String> {
    Ok(encode_query(&parse_json(raw, "query")?))
}

fn pretty(value: &impl serde::Serialize) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| miette!("failed to render output: {}", e))
}

/// A repository and a branch over it.
pub struct Session {
    repository: Arc<Repository>,
    branch: Arc<Branch>,
    timeout: Duration,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, config: RepositoryConfig, timeout: Duration) -> Self {
        let repository = Repository::new(transport, config);
        let branch = Branch::new(repository.clone());
        Self {
            repository,
            branch,
            timeout,
        }
    }

    /// Re-run `read` after every repository update until it yields a value.
    async fn settle<T>(
        &self,
        mut read: impl FnMut() -> std::result::Result<Option<T>, CacheError>,
    ) -> Result<T> {
        let mut updates = self.repository.subscribe();
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Some(value) = read().map_err(|e| miette!("{}", e))? {
                return Ok(value);
            }
            match tokio::time::timeout_at(deadline, updates.recv()).await {
                Ok(Ok(update)) => debug!(?update, "repository update"),
                Ok(Err(RecvError::Lagged(skipped))) => debug!(skipped, "update receiver lagged"),
                Ok(Err(RecvError::Closed)) => return Err(miette!("repository closed")),
                Err(_) => {
                    return Err(miette!(
                        "timed out after {}ms waiting for data",
                        self.timeout.as_millis()
                    ));
                }
            }
        }
    }

    async fn load_item(&self, model: &str, id: &Id) -> Result<Entity> {
        self.settle(|| {
            let view = self.branch.get_item(model, id)?;
            Ok(if view.is_loading { None } else { view.item })
        })
        .await
    }

    pub async fn item(&self, model: &str, id: &Id) -> Result<String> {
        let entity = self.load_item(model, id).await?;
        pretty(&entity)
    }

    pub async fn list(&self, model: &str, query: Value) -> Result<String> {
        let list = List::new(self.branch.clone(), model, Some(query));
        let state = self
            .settle(|| {
                let state = list.read()?;
                Ok((!state.is_loading).then_some(state))
            })
            .await?;
        pretty(&json!({
            "items": state.items,
            "totalCount": state.total_count,
        }))
    }

    /// Sum a numeric attribute over a list. Non-numeric values count as zero.
    pub async fn sum(&self, model: &str, query: Value, attribute: &str) -> Result<String> {
        let reduce = Reduce::new(self.branch.clone(), model, Some(query));
        let total = self
            .settle(|| {
                let view = reduce.fold(0.0, |acc, item, _| {
                    acc + item
                        .attributes
                        .get(attribute)
                        .and_then(Value::as_f64)
                        .unwrap_or_default()
                })?;
                Ok((!view.is_loading).then_some(view.accumulator))
            })
            .await?;

        let total = if total.fract() == 0.0 && total.abs() < 9.0e15 {
            json!(total as i64)
        } else {
            json!(total)
        };
        Ok(total.to_string())
    }

    /// Commit attributes to an item and report the resulting changes view.
    pub async fn edit(
        &self,
        model: &str,
        id: &Id,
        attributes: Attributes,
        mode: EditMode,
    ) -> Result<String> {
        self.load_item(model, id).await?;
        self.branch
            .commit_attributes(model, Some(id), attributes)
            .map_err(|e| miette!("{}", e))?;

        let changes = Merge::new(self.branch.clone()).changes();
        let committed = match mode {
            EditMode::Preview => 0,
            EditMode::Merge => Merge::new(self.branch.clone()).merge_all(),
            EditMode::Push => Push::new(self.branch.clone()).push_all(),
        };
        info!(model, key = %id.key(), committed, ?mode, "edit applied");

        let stored = self.repository.original(model, &id.key());
        pretty(&json!({
            "changes": changes,
            "committed": committed,
            "stored": stored,
        }))
    }
}
