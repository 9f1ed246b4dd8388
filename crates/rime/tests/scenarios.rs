//! End-to-end flows through branches, reconciliation and views.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use rime::{
    Attributes, Branch, CacheError, Entity, Id, Item, ItemWrite, List, MemoryTransport, Merge,
    Push, Reduce, Ref, Repository, RepositoryConfig, RepositoryUpdate, Resource,
};

struct Fixture {
    transport: Arc<MemoryTransport>,
    repository: Arc<Repository>,
    updates: broadcast::Receiver<RepositoryUpdate>,
}

impl Fixture {
    /// A blog with list `{page: 1}` holding posts "1" and "2" out of 5.
    fn blog() -> Self {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(Entity::new("blogPost", "1").with_attribute("counter", json!(0)));
        transport.insert(Entity::new("blogPost", "2").with_attribute("counter", json!(5)));
        transport.set_list(
            "blogPost",
            &page(),
            vec![
                Resource::stub("blogPost", "1"),
                Resource::stub("blogPost", "2"),
            ],
            5,
        );
        let repository = Repository::new(
            transport.clone(),
            RepositoryConfig::default().with_insert_debounce_ms(0),
        );
        let updates = repository.subscribe();
        Self {
            transport,
            repository,
            updates,
        }
    }

    fn branch(&self) -> Arc<Branch> {
        Branch::new(self.repository.clone())
    }

    /// Wait for repository updates until `done` holds.
    async fn settle(&mut self, mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                self.updates.recv().await.unwrap();
            }
        })
        .await
        .expect("repository did not settle");
    }
}

fn page() -> Value {
    json!({"page": 1})
}

fn attributes(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn counter(branch: &Branch, id: &str) -> Option<Value> {
    branch
        .get_item("blogPost", &Id::from(id))
        .unwrap()
        .item
        .map(|item| item.attributes["counter"].clone())
}

#[tokio::test]
async fn test_two_branch_counter_scenario() {
    let mut fixture = Fixture::blog();
    let a = fixture.branch();
    let b = fixture.branch();

    let list = a.get_list("blogPost", &page()).unwrap();
    assert!(list.is_loading);
    assert!(list.items.is_empty());
    fixture
        .settle(|| !a.get_list("blogPost", &page()).unwrap().is_loading)
        .await;

    let list = a.get_list("blogPost", &page()).unwrap();
    assert_eq!(
        list.items,
        vec![Ref::new("blogPost", "1"), Ref::new("blogPost", "2")]
    );
    assert_eq!(list.total_count, 5);

    assert_eq!(counter(&a, "1"), None);
    fixture.settle(|| counter(&a, "1").is_some()).await;
    assert_eq!(counter(&a, "1"), Some(json!(0)));

    a.commit_attributes("blogPost", Some(&Id::from("1")), attributes(json!({"counter": 1})))
        .unwrap();

    assert_eq!(counter(&a, "1"), Some(json!(1)));
    assert_eq!(counter(&b, "1"), Some(json!(0)));
    let stored = fixture
        .repository
        .original("blogPost", &Id::from("1").key())
        .unwrap();
    assert_eq!(stored.attributes["counter"], json!(0));
    assert_eq!(fixture.transport.item_reads("blogPost"), 1);

    Merge::new(a.clone()).merge_all();
    assert_eq!(counter(&b, "1"), Some(json!(1)));
    assert!(a.change_log().is_empty());
}

#[tokio::test]
async fn test_branch_reads_deduplicate_fetches() {
    let mut fixture = Fixture::blog();
    let a = fixture.branch();
    let b = fixture.branch();

    assert!(a.get_item("blogPost", &Id::from("1")).unwrap().is_loading);
    assert!(b.get_item("blogPost", &Id::from("1")).unwrap().is_loading);
    assert!(a.get_item("blogPost", &Id::from("1")).unwrap().is_loading);
    fixture.settle(|| counter(&a, "1").is_some()).await;

    assert_eq!(fixture.transport.item_reads("blogPost"), 1);
}

#[tokio::test]
async fn test_record_ids_hit_the_same_slot_regardless_of_key_order() {
    let mut fixture = Fixture::blog();
    let first = Id::try_from(&json!({"foo": "foo1", "bar": "bar1"})).unwrap();
    let second = Id::try_from(&json!({"bar": "bar1", "foo": "foo1"})).unwrap();
    fixture
        .transport
        .insert(Entity::new("composite", first.clone()).with_attribute("v", json!(1)));
    let branch = fixture.branch();

    branch.get_item("composite", &first).unwrap();
    fixture
        .settle(|| branch.get_item("composite", &second).unwrap().item.is_some())
        .await;

    assert_eq!(fixture.transport.item_reads("composite"), 1);
}

#[tokio::test]
async fn test_deletion_merge_hides_item_and_refetches_list_once() {
    let mut fixture = Fixture::blog();
    let a = fixture.branch();
    let b = fixture.branch();

    a.get_list("blogPost", &page()).unwrap();
    fixture
        .settle(|| !a.get_list("blogPost", &page()).unwrap().is_loading)
        .await;
    assert_eq!(fixture.transport.list_reads("blogPost"), 1);

    // The server drops the item as well.
    fixture.transport.set_list(
        "blogPost",
        &page(),
        vec![Resource::stub("blogPost", "2")],
        4,
    );
    Merge::new(a.clone()).merge(vec![ItemWrite::delete("blogPost", "1")]);

    let list = b.get_list("blogPost", &page()).unwrap();
    assert!(list.is_loading);
    assert_eq!(list.items, vec![Ref::new("blogPost", "2")]);
    assert_eq!(list.total_count, 5);

    let err = b.get_item("blogPost", &Id::from("1")).unwrap_err();
    assert!(matches!(err, CacheError::Deleted { .. }));
    assert!(err.to_string().contains("deleted"));

    // Repeated stale reads while loading do not refetch.
    a.get_list("blogPost", &page()).unwrap();
    b.get_list("blogPost", &page()).unwrap();

    fixture
        .settle(|| !b.get_list("blogPost", &page()).unwrap().is_loading)
        .await;
    let list = b.get_list("blogPost", &page()).unwrap();
    assert_eq!(list.total_count, 4);
    assert_eq!(fixture.transport.list_reads("blogPost"), 2);
}

#[tokio::test]
async fn test_push_does_not_invalidate_lists() {
    let mut fixture = Fixture::blog();
    let branch = fixture.branch();

    branch.get_list("blogPost", &page()).unwrap();
    branch.get_item("blogPost", &Id::from("1")).unwrap();
    fixture
        .settle(|| {
            !branch.get_list("blogPost", &page()).unwrap().is_loading
                && counter(&branch, "1").is_some()
        })
        .await;

    branch
        .commit_attributes("blogPost", Some(&Id::from("1")), attributes(json!({"counter": 9})))
        .unwrap();
    let push = Push::new(branch.clone());
    assert_eq!(push.changes().len(), 1);
    assert_eq!(push.push_all(), 1);

    let list = branch.get_list("blogPost", &page()).unwrap();
    assert!(!list.is_loading);
    assert_eq!(fixture.transport.list_reads("blogPost"), 1);
    assert_eq!(counter(&fixture.branch(), "1"), Some(json!(9)));
}

#[tokio::test]
async fn test_merge_resets_only_accepted_entries() {
    let mut fixture = Fixture::blog();
    let branch = fixture.branch();
    branch.get_item("blogPost", &Id::from("1")).unwrap();
    branch.get_item("blogPost", &Id::from("2")).unwrap();
    fixture
        .settle(|| counter(&branch, "1").is_some() && counter(&branch, "2").is_some())
        .await;

    for id in ["1", "2"] {
        branch
            .commit_attributes("blogPost", Some(&Id::from(id)), attributes(json!({"counter": 42})))
            .unwrap();
    }

    let merge = Merge::new(branch.clone());
    let changes = merge.changes();
    let accepted = changes
        .get("blogPost", &Id::from("1").key())
        .map(|change| ItemWrite::upsert(change.to_entity()))
        .into_iter()
        .collect();
    merge.merge(accepted);

    let remaining = merge.changes();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.get("blogPost", &Id::from("2").key()).is_some());
    assert_eq!(counter(&fixture.branch(), "1"), Some(json!(42)));
    assert_eq!(counter(&fixture.branch(), "2"), Some(json!(5)));
}

#[tokio::test]
async fn test_failed_item_read_surfaces_error() {
    let mut fixture = Fixture::blog();
    fixture
        .transport
        .fail_item("blogPost", &Id::from("1"), "offline");
    let item = Item::new(fixture.branch(), "blogPost", Some(Id::from("1")));

    assert!(item.read().unwrap().is_loading);
    fixture.settle(|| item.read().is_err()).await;

    match item.read() {
        Err(CacheError::Fetch { model, source, .. }) => {
            assert_eq!(model, "blogPost");
            assert_eq!(source.to_string(), "read rejected: offline");
        }
        other => panic!("expected fetch error, got {other:?}"),
    }
    assert_eq!(fixture.transport.item_reads("blogPost"), 1);
}

#[tokio::test]
async fn test_list_view_reports_loading_then_items() {
    let mut fixture = Fixture::blog();
    let list = List::new(fixture.branch(), "blogPost", Some(page()));

    let state = list.read().unwrap();
    assert!(state.is_loading);
    assert!(!state.is_empty);

    fixture.settle(|| !list.read().unwrap().is_loading).await;
    let count = list.render(|state| state.items.len()).unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_reduce_sums_resolved_items_with_branch_edits() {
    let mut fixture = Fixture::blog();
    let branch = fixture.branch();
    let reduce = Reduce::new(branch.clone(), "blogPost", Some(page()));
    let sum = |reduce: &Reduce| {
        reduce
            .fold(0, |acc, item, _| {
                acc + item.attributes["counter"].as_i64().unwrap_or_default()
            })
            .unwrap()
    };

    let view = sum(&reduce);
    assert!(view.is_loading);
    assert_eq!(view.accumulator, 0);

    fixture.settle(|| !sum(&reduce).is_loading).await;
    let view = sum(&reduce);
    assert!(!view.is_empty);
    assert_eq!(view.accumulator, 5);

    branch
        .commit_attributes("blogPost", Some(&Id::from("2")), attributes(json!({"counter": 10})))
        .unwrap();
    assert_eq!(sum(&reduce).accumulator, 10);

    let indices = reduce
        .fold(Vec::new(), |mut acc, item, index| {
            acc.push((item.key(), index));
            acc
        })
        .unwrap()
        .accumulator;
    assert_eq!(
        indices,
        vec![(r#""1""#.to_string(), 0), (r#""2""#.to_string(), 1)]
    );
}

#[tokio::test]
async fn test_sibling_branches_are_isolated_until_merge() {
    let mut fixture = Fixture::blog();
    let a = fixture.branch();
    let b = fixture.branch();
    a.get_item("blogPost", &Id::from("2")).unwrap();
    fixture.settle(|| counter(&a, "2").is_some()).await;

    a.commit_attributes("blogPost", Some(&Id::from("2")), attributes(json!({"counter": 6})))
        .unwrap();
    b.commit_attributes("blogPost", Some(&Id::from("2")), attributes(json!({"counter": 7})))
        .unwrap();

    assert_eq!(counter(&a, "2"), Some(json!(6)));
    assert_eq!(counter(&b, "2"), Some(json!(7)));

    Merge::new(a).merge_all();
    // b still overlays its own edit on the new original.
    assert_eq!(counter(&b, "2"), Some(json!(7)));
    let changes = Merge::new(b).changes();
    assert_eq!(
        changes
            .get("blogPost", &Id::from("2").key())
            .unwrap()
            .changed_attributes,
        attributes(json!({"counter": 7}))
    );
}
