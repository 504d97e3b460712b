#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::{json, Value as Json};
use tabula_api::{
    ApiError, DeleteClient, DeleteFailure, DeleteItemResult, DeletionType, FieldUpdate,
    MockDeleteClient, MockValidationClient, RecordedCall, StoredValueResolver, UpdateResult,
    ValidationClient,
};
use tabula_core::{ItemStatus, ListRow};
use tabula_engine::{new_row_key, Engine, ListContext};
use tabula_store::{ItemStatusStore, ItemStore, SelectionStore, StatusUpdate};

struct Fixture {
    items: Arc<ItemStore>,
    statuses: Arc<ItemStatusStore>,
    selection: Arc<SelectionStore>,
    validator: Arc<MockValidationClient>,
    deleter: Arc<MockDeleteClient>,
    engine: Arc<Engine>,
}

fn fixture() -> Fixture {
    let items = Arc::new(ItemStore::new());
    let statuses = Arc::new(ItemStatusStore::new());
    let selection = Arc::new(SelectionStore::new());
    let validator = Arc::new(MockValidationClient::new());
    let deleter = Arc::new(MockDeleteClient::new());
    let engine = Arc::new(Engine::new(
        ListContext {
            list_url: "https://example.test/lists/tasks".into(),
            list_id: "tasks".into(),
            parent_key: String::new(),
        },
        Arc::clone(&items),
        Arc::clone(&statuses),
        Arc::clone(&selection),
        Arc::clone(&validator) as Arc<dyn ValidationClient>,
        Arc::clone(&deleter) as Arc<dyn DeleteClient>,
        Arc::new(StoredValueResolver),
    ));
    Fixture { items, statuses, selection, validator, deleter, engine }
}

fn row(pairs: &[(&str, Json)]) -> ListRow {
    let mut row = ListRow::new();
    for (name, value) in pairs {
        row.set(*name, value.clone());
    }
    row
}

#[tokio::test]
async fn create_appends_a_render_shaped_row() {
    let f = fixture();
    let temp_key = new_row_key();
    let item = row(&[
        ("ID", json!(temp_key.clone())),
        ("Title", json!("t")),
        ("Owner", json!("o")),
    ]);

    // Creation response carries the new identity but not a consumable row.
    f.validator.push_response(Ok(UpdateResult {
        list_row: ListRow::new(),
        form_values: vec![FieldUpdate::new("Id", json!(41))],
    }));
    // The follow-up fetch returns the row in render shape.
    f.validator.push_response(Ok(UpdateResult {
        list_row: row(&[("ID", json!("41")), ("Title", json!("t")), ("Owner", json!("o"))]),
        form_values: vec![],
    }));

    f.engine.create_item(&item).await.unwrap();

    let calls = f.validator.calls();
    assert_eq!(calls.len(), 2);
    match &calls[0] {
        RecordedCall::Create { item_id, updates, .. } => {
            assert_eq!(item_id, &temp_key);
            // Every field except the identity goes out.
            assert_eq!(updates.len(), 2);
            assert!(updates.iter().all(|u| u.field_name != "ID"));
        }
        other => panic!("unexpected call: {other:?}"),
    }
    match &calls[1] {
        RecordedCall::Update { item_id, updates, .. } => {
            assert_eq!(item_id, "41");
            assert!(updates.is_empty());
        }
        other => panic!("unexpected call: {other:?}"),
    }

    assert!(f.items.get_item("41").is_some());
    assert!(f.statuses.get_status(&temp_key).is_none());
}

#[tokio::test]
async fn create_without_an_identity_outcome_errors() {
    let f = fixture();
    let item = row(&[("ID", json!("new-item-1")), ("Title", json!("t"))]);

    f.validator.push_response(Ok(UpdateResult {
        list_row: ListRow::new(),
        form_values: vec![FieldUpdate::accepted("Title")],
    }));

    let err = f.engine.create_item(&item).await.unwrap_err();
    assert!(matches!(err, ApiError::Internal(_)));
    assert!(f.items.is_empty());
    assert!(f.statuses.is_empty());
}

#[tokio::test]
async fn create_failure_clears_the_placeholder_flag() {
    let f = fixture();
    let item = row(&[("ID", json!("new-item-2")), ("Title", json!("t"))]);
    f.validator.push_response(Err(ApiError::Transport("down".into())));

    let err = f.engine.create_item(&item).await.unwrap_err();
    assert!(matches!(err, ApiError::Transport(_)));
    assert!(f.statuses.is_empty());
}

#[tokio::test]
async fn full_delete_clears_every_store() {
    let f = fixture();
    let one = row(&[("ID", json!("1")), ("Title", json!("a"))]);
    let two = row(&[("ID", json!("2")), ("Title", json!("b"))]);
    f.items.update_items("test", vec![one.clone(), two.clone()]);
    f.selection.select("test", &["1".to_string(), "2".to_string()]);
    f.statuses.update_statuses(
        "test",
        vec![StatusUpdate::new("1", ItemStatus { is_updating: true, ..ItemStatus::default() })],
    );

    let deleted = f.engine.delete_items(&[one, two]).await.unwrap();
    assert_eq!(deleted, vec!["1".to_string(), "2".to_string()]);

    assert!(f.items.is_empty());
    assert!(f.selection.is_empty());
    assert!(f.statuses.is_empty());

    let contexts = f.deleter.contexts();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].deletion_type, DeletionType::Recycle);
    assert_eq!(contexts[0].list_id, "tasks");
    assert_eq!(contexts[0].items.len(), 2);
    assert_eq!(contexts[0].items[0].properties.get("Title"), Some(&json!("a")));
}

#[tokio::test]
async fn partial_delete_removes_only_the_succeeded_subset() {
    let f = fixture();
    let rows: Vec<ListRow> = ["1", "2", "3"]
        .iter()
        .map(|id| row(&[("ID", json!(*id)), ("Title", json!("x"))]))
        .collect();
    f.items.update_items("test", rows.clone());
    f.selection
        .select("test", &["1".to_string(), "2".to_string(), "3".to_string()]);

    f.deleter.push_response(Err(DeleteFailure {
        message: "409".into(),
        items: Some(vec![
            DeleteItemResult { key: "1".into(), error: None },
            DeleteItemResult { key: "2".into(), error: None },
            DeleteItemResult { key: "3".into(), error: Some("locked".into()) },
        ]),
    }));

    let failure = f.engine.delete_items(&rows).await.unwrap_err();
    // The raw failure reaches the caller untouched.
    assert_eq!(failure.message, "409");
    assert_eq!(failure.items.as_ref().map(Vec::len), Some(3));

    assert!(f.items.get_item("1").is_none());
    assert!(f.items.get_item("2").is_none());
    assert!(f.items.get_item("3").is_some());
    assert_eq!(f.selection.selected(), vec!["3".to_string()]);
}

#[tokio::test]
async fn delete_failure_without_details_removes_nothing() {
    let f = fixture();
    let one = row(&[("ID", json!("1")), ("Title", json!("a"))]);
    f.items.update_items("test", vec![one.clone()]);
    f.selection.select("test", &["1".to_string()]);

    f.deleter.push_response(Err(DeleteFailure::new("500")));

    let failure = f.engine.delete_items(&[one]).await.unwrap_err();
    assert_eq!(failure.message, "500");
    assert!(f.items.get_item("1").is_some());
    assert!(f.selection.is_selected("1"));
}
