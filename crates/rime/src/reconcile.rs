//! Reconciliation of branch edits against the repository.
//!
//! [`Merge`] and [`Push`] compute the same [`Changes`] view: the fields a
//! branch's log actually changes relative to the stored originals. They
//! differ only in whether committing invalidates cached lists.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::branch::{Branch, ChangeEntry, FieldChange};
use crate::codec::Id;
use crate::repository::{ItemWrite, Repository};
use crate::types::{Attributes, Entity, Relationships};

/// Pending edits for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingChange {
    pub model: String,
    pub id: Id,
    /// Original attributes with every edit applied.
    pub attributes: Attributes,
    /// Only the attributes that differ from the original.
    pub changed_attributes: Attributes,
    pub relationships: Relationships,
    pub changed_relationships: Relationships,
}

impl PendingChange {
    fn seed(entry: &ChangeEntry, original: Option<Entity>) -> Self {
        let (attributes, relationships) = original
            .map(|entity| (entity.attributes, entity.relationships))
            .unwrap_or_default();
        Self {
            model: entry.model.clone(),
            id: entry.id.clone(),
            attributes,
            changed_attributes: Attributes::new(),
            relationships,
            changed_relationships: Relationships::new(),
        }
    }

    /// No field differs from the original.
    pub fn is_unchanged(&self) -> bool {
        self.changed_attributes.is_empty() && self.changed_relationships.is_empty()
    }

    /// The edited entity as it would be written.
    pub fn to_entity(&self) -> Entity {
        Entity {
            model: self.model.clone(),
            id: self.id.clone(),
            attributes: self.attributes.clone(),
            relationships: self.relationships.clone(),
        }
    }
}

/// Pending edits of a branch, by model and canonical id key.
///
/// Entities without changed fields never appear, and neither do empty model
/// buckets, so an empty view means there is nothing to submit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Changes(BTreeMap<String, BTreeMap<String, PendingChange>>);

impl Changes {
    /// Diff a change log against the repository's originals.
    ///
    /// Items without an original diff against an empty entity, so every
    /// edited field counts as changed.
    pub fn compute(repository: &Repository, log: &[ChangeEntry]) -> Self {
        let mut working: BTreeMap<String, BTreeMap<String, (PendingChange, Option<Entity>)>> =
            BTreeMap::new();

        for entry in log {
            let (change, original) = working
                .entry(entry.model.clone())
                .or_default()
                .entry(entry.key.clone())
                .or_insert_with(|| {
                    let original = repository.original(&entry.model, &entry.key);
                    (PendingChange::seed(entry, original.clone()), original)
                });

            match &entry.change {
                FieldChange::Attributes(attributes) => {
                    for (name, value) in attributes {
                        let unchanged = original
                            .as_ref()
                            .and_then(|original| original.attributes.get(name))
                            .is_some_and(|stored| stored == value);
                        change.attributes.insert(name.clone(), value.clone());
                        if unchanged {
                            change.changed_attributes.remove(name);
                        } else {
                            change.changed_attributes.insert(name.clone(), value.clone());
                        }
                    }
                }
                FieldChange::Relationships(relationships) => {
                    for (name, value) in relationships {
                        let unchanged = original
                            .as_ref()
                            .and_then(|original| original.relationships.get(name))
                            .is_some_and(|stored| stored.same_as(value));
                        change.relationships.insert(name.clone(), value.clone());
                        if unchanged {
                            change.changed_relationships.remove(name);
                        } else {
                            change
                                .changed_relationships
                                .insert(name.clone(), value.clone());
                        }
                    }
                }
            }
        }

        let changes = working
            .into_iter()
            .filter_map(|(model, entities)| {
                let entities: BTreeMap<_, _> = entities
                    .into_iter()
                    .filter(|(_, (change, _))| !change.is_unchanged())
                    .map(|(key, (change, _))| (key, change))
                    .collect();
                (!entities.is_empty()).then_some((model, entities))
            })
            .collect();
        Self(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entities with pending edits.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn get(&self, model: &str, key: &str) -> Option<&PendingChange> {
        self.0.get(model)?.get(key)
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingChange> {
        self.0.values().flat_map(BTreeMap::values)
    }

    /// Accept every pending change as an upsert.
    pub fn accept_all(&self) -> Vec<ItemWrite> {
        self.iter()
            .map(|change| ItemWrite::upsert(change.to_entity()))
            .collect()
    }
}

/// Write accepted edits and clear them from the branch log.
fn commit(branch: &Branch, accepted: Vec<ItemWrite>, invalidate_involved_list_caches: bool) {
    let mut keys: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for write in &accepted {
        keys.entry(write.model().to_string())
            .or_default()
            .insert(write.key());
    }

    let count = accepted.len();
    branch
        .repository()
        .insert_items(accepted, invalidate_involved_list_caches);
    branch.reset_changelog(&keys);
    info!(
        count,
        invalidate = invalidate_involved_list_caches,
        "committed branch edits"
    );
}

/// Commits edits and invalidates every cached list of a touched model.
#[derive(Debug, Clone)]
pub struct Merge {
    branch: Arc<Branch>,
}

impl Merge {
    pub fn new(branch: Arc<Branch>) -> Self {
        Self { branch }
    }

    pub fn changes(&self) -> Changes {
        Changes::compute(self.branch.repository(), &self.branch.change_log())
    }

    /// Write `accepted` (deletions included) and reset their log entries.
    pub fn merge(&self, accepted: Vec<ItemWrite>) {
        commit(&self.branch, accepted, true);
    }

    /// Merge every pending change. Returns the number of entities written.
    pub fn merge_all(&self) -> usize {
        let accepted = self.changes().accept_all();
        let count = accepted.len();
        if count > 0 {
            self.merge(accepted);
        }
        count
    }
}

/// Commits edits without touching cached lists.
///
/// Meant for narrow field corrections that should not force a list refetch.
#[derive(Debug, Clone)]
pub struct Push {
    branch: Arc<Branch>,
}

impl Push {
    pub fn new(branch: Arc<Branch>) -> Self {
        Self { branch }
    }

    pub fn changes(&self) -> Changes {
        Changes::compute(self.branch.repository(), &self.branch.change_log())
    }

    pub fn push(&self, accepted: Vec<ItemWrite>) {
        commit(&self.branch, accepted, false);
    }

    /// Push every pending change. Returns the number of entities written.
    pub fn push_all(&self) -> usize {
        let accepted = self.changes().accept_all();
        let count = accepted.len();
        if count > 0 {
            self.push(accepted);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::transport::MemoryTransport;
    use crate::types::{Ref, Relationship};
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    fn setup() -> Arc<Branch> {
        let repository = Repository::new(
            Arc::new(MemoryTransport::new()),
            RepositoryConfig::default(),
        );
        repository.insert_items(
            vec![ItemWrite::upsert(
                Entity::new("blogPost", "1")
                    .with_attribute("name", json!("foo"))
                    .with_attribute("tags", json!(["a", "b"]))
                    .with_relationship("author", Relationship::One(Ref::new("user", 0)))
                    .with_relationship(
                        "comments",
                        Relationship::Many(vec![Ref::new("comment", 1), Ref::new("comment", 2)]),
                    ),
            )],
            false,
        );
        Branch::new(repository)
    }

    fn attributes(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn relationship(name: &str, value: Relationship) -> Relationships {
        Relationships::from([(name.to_string(), value)])
    }

    #[test]
    fn test_changed_attribute_is_reported() {
        let branch = setup();
        let id = Id::from("1");
        branch
            .commit_attributes("blogPost", Some(&id), attributes(json!({"name": "bar"})))
            .unwrap();

        let changes = Merge::new(branch).changes();
        let change = changes.get("blogPost", &id.key()).unwrap();
        assert_eq!(change.changed_attributes, attributes(json!({"name": "bar"})));
        assert_eq!(change.attributes["tags"], json!(["a", "b"]));
        assert!(change.changed_relationships.is_empty());
    }

    #[test]
    fn test_round_trip_cancels_and_drops_bucket() {
        let branch = setup();
        let id = Id::from("1");
        branch
            .commit_attributes("blogPost", Some(&id), attributes(json!({"name": "bar"})))
            .unwrap();
        branch
            .commit_attributes("blogPost", Some(&id), attributes(json!({"name": "foo"})))
            .unwrap();

        let changes = Push::new(branch).changes();
        assert!(changes.is_empty());
        assert_eq!(changes.models().count(), 0);
    }

    #[test]
    fn test_structural_attribute_equality() {
        let branch = setup();
        branch
            .commit_attributes(
                "blogPost",
                Some(&Id::from("1")),
                attributes(json!({"tags": ["a", "b"]})),
            )
            .unwrap();
        assert!(Merge::new(branch).changes().is_empty());
    }

    #[test]
    fn test_relationship_equality_by_model_and_id() {
        let branch = setup();
        let id = Id::from("1");
        branch
            .commit_relationships(
                "blogPost",
                Some(&id),
                relationship("author", Relationship::One(Ref::new("user", 0))),
            )
            .unwrap();
        assert!(Merge::new(branch.clone()).changes().is_empty());

        branch
            .commit_relationships(
                "blogPost",
                Some(&id),
                relationship(
                    "comments",
                    Relationship::Many(vec![Ref::new("comment", 2), Ref::new("comment", 1)]),
                ),
            )
            .unwrap();
        let changes = Merge::new(branch).changes();
        let change = changes.get("blogPost", &id.key()).unwrap();
        assert!(change.changed_relationships.contains_key("comments"));
        assert!(!change.changed_relationships.contains_key("author"));
    }

    #[test]
    fn test_null_relationship_only_equals_null() {
        let branch = setup();
        branch
            .commit_relationships(
                "blogPost",
                Some(&Id::from("1")),
                relationship("author", Relationship::Null),
            )
            .unwrap();
        assert_eq!(Merge::new(branch).changes().len(), 1);
    }

    #[test]
    fn test_edit_without_original_is_a_creation() {
        let branch = setup();
        let id = Id::from("new");
        branch
            .commit_attributes("blogPost", Some(&id), attributes(json!({"name": "fresh"})))
            .unwrap();

        let changes = Merge::new(branch).changes();
        let change = changes.get("blogPost", &id.key()).unwrap();
        assert_eq!(change.attributes, attributes(json!({"name": "fresh"})));
        assert_eq!(change.changed_attributes, attributes(json!({"name": "fresh"})));
    }

    #[test]
    fn test_merge_all_writes_and_resets() {
        let branch = setup();
        let id = Id::from("1");
        branch
            .commit_attributes("blogPost", Some(&id), attributes(json!({"name": "bar"})))
            .unwrap();

        assert_eq!(Merge::new(branch.clone()).merge_all(), 1);
        assert!(branch.change_log().is_empty());
        let stored = branch.repository().original("blogPost", &id.key()).unwrap();
        assert_eq!(stored.attributes["name"], json!("bar"));
        assert_eq!(stored.attributes["tags"], json!(["a", "b"]));

        assert_eq!(Merge::new(branch).merge_all(), 0);
    }

    #[test]
    fn test_changes_serialize_by_model_and_key() {
        let branch = setup();
        branch
            .commit_attributes(
                "blogPost",
                Some(&Id::from("1")),
                attributes(json!({"name": "bar"})),
            )
            .unwrap();
        let value = serde_json::to_value(Merge::new(branch).changes()).unwrap();
        assert_eq!(
            value["blogPost"][r#""1""#]["changed_attributes"],
            json!({"name": "bar"})
        );
    }
}
