//! Integration test: selection algebra against both store backends.
//!
//! A={1,2,3}, B={2,3,4}, C={3}, everyone also in `all`.
use std::sync::Arc;

use switchboard_protocol::store::join_batch;
use switchboard_protocol::{
    ConnectionId, Filters, GroupId, MembershipStore, MemoryBroker, MemoryStore, Publisher,
    SelectionRule, SqliteStore,
};

async fn seed(store: &dyn MembershipStore) {
    let layout: &[(&str, &[&str])] = &[
        ("1", &["all", "A"]),
        ("2", &["all", "A", "B"]),
        ("3", &["all", "A", "B", "C"]),
        ("4", &["all", "B"]),
        ("5", &["all"]),
    ];
    for (id, groups) in layout {
        let groups: Vec<GroupId> = groups.iter().map(|g| GroupId::from(*g)).collect();
        store
            .exec(join_batch(&ConnectionId::from(*id), &groups))
            .await
            .expect("seed");
    }
}

fn publisher() -> Publisher {
    Publisher::new(Arc::new(MemoryBroker::new()), "sb:", "test-node")
}

fn ids(list: &[&str]) -> Vec<ConnectionId> {
    list.iter().map(|id| ConnectionId::from(*id)).collect()
}

async fn check_algebra(store: &dyn MembershipStore) {
    seed(store).await;
    let filters = Filters::new();
    let p = publisher();

    let union_only = p.select().to(["A"]).only(["B"]);
    assert_eq!(union_only.resolve(store, &filters).await.unwrap(), ids(&["2", "3"]));

    let without_c = p.select().to(["A"]).only(["B"]).not(["C"]);
    assert_eq!(without_c.resolve(store, &filters).await.unwrap(), ids(&["2"]));

    let everyone = p.select();
    assert_eq!(
        everyone.resolve(store, &filters).await.unwrap(),
        ids(&["1", "2", "3", "4", "5"])
    );

    let either = p.select().to(["A", "B"]).not(["C"]);
    assert_eq!(either.resolve(store, &filters).await.unwrap(), ids(&["1", "2", "4"]));

    let nobody = p.select().to(["A"]).only(["missing"]);
    assert!(nobody.resolve(store, &filters).await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_store_algebra() {
    let store = MemoryStore::new();
    check_algebra(&store).await;
    // Scratch sets never outlive their batch: 4 groups and 5 indexes.
    assert_eq!(store.snapshot("g:A"), vec!["1", "2", "3"]);
    assert_eq!(store.set_count(), 9);
}

#[tokio::test]
async fn sqlite_store_algebra() {
    let store = SqliteStore::open_in_memory().unwrap();
    check_algebra(&store).await;
}

#[tokio::test]
async fn named_filter_narrows_resolution() {
    let store = MemoryStore::new();
    seed(&store).await;
    let mut filters = Filters::new();
    filters.insert("odd", |id: &ConnectionId| {
        id.as_str().parse::<u32>().map(|n| n % 2 == 1).unwrap_or(false)
    });

    let p = publisher();
    let odd = p.select().to(["A", "B"]).filter("odd");
    assert_eq!(odd.resolve(&store, &filters).await.unwrap(), ids(&["1", "3"]));

    let unknown = p.select().to(["C"]).filter("nope");
    assert_eq!(unknown.resolve(&store, &filters).await.unwrap(), ids(&["3"]));
}

#[tokio::test]
async fn selector_from_rule_matches_builder() {
    let store = MemoryStore::new();
    seed(&store).await;
    let rule = SelectionRule {
        or: vec!["B".into()],
        and: Vec::new(),
        not: vec!["A".into()],
        filter: None,
    };
    let selector = switchboard_protocol::Selector::from_rule(publisher(), rule.clone());
    assert_eq!(selector.rule(), &rule);
    assert_eq!(
        selector.resolve(&store, &Filters::new()).await.unwrap(),
        ids(&["4"])
    );
}

#[tokio::test]
async fn unavailable_store_fails_resolution() {
    let store = MemoryStore::new();
    seed(&store).await;
    store.set_unavailable(true);
    let result = publisher().select().to(["A"]).resolve(&store, &Filters::new()).await;
    assert!(result.is_err());
}
