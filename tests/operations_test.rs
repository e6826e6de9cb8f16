//! Integration tests for the operation layer

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use highlight_store::config::DatabaseConfig;
use highlight_store::schema::{conversations, highlights, users};
use highlight_store::{Database, DbOperations, KeyRange, SchemaRegistry, StoreError};

fn operations(dir: &TempDir) -> DbOperations {
    let db = Database::new(DatabaseConfig::at(dir.path()), SchemaRegistry::default());
    DbOperations::new(Arc::new(db))
}

fn user(id: &str, email: &str) -> Value {
    json!({"id": id, "email": email, "name": id})
}

#[tokio::test]
async fn test_first_operation_opens_the_store() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);
    assert!(!ops.database().is_initialized());

    let found: Option<Value> = ops.get(users::COLLECTION, "nobody").await.unwrap();
    assert!(found.is_none());
    assert!(ops.database().is_initialized());
    assert_eq!(ops.database().version().unwrap(), 1);
}

#[tokio::test]
async fn test_put_is_an_upsert() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    let key = ops.put(users::COLLECTION, &user("u1", "a@example.com")).await.unwrap();
    assert_eq!(key, json!("u1"));
    ops.put(users::COLLECTION, &json!({"id": "u1", "email": "a@example.com", "name": "Ada"}))
        .await
        .unwrap();

    let stored: Value = ops.get(users::COLLECTION, "u1").await.unwrap().unwrap();
    assert_eq!(stored["name"], "Ada");
    assert_eq!(ops.count(users::COLLECTION, None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_add_rejects_existing_primary_key() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    ops.add(users::COLLECTION, &user("u1", "a@example.com")).await.unwrap();
    let err = ops.add(users::COLLECTION, &user("u1", "b@example.com")).await.unwrap_err();
    assert!(err.is_duplicate_key());
}

#[tokio::test]
async fn test_unique_index_enforced_by_add_only() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    ops.add(users::COLLECTION, &user("u1", "shared@example.com")).await.unwrap();
    let err = ops.add(users::COLLECTION, &user("u2", "shared@example.com")).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey { .. }));
    assert_eq!(ops.count(users::COLLECTION, None).await.unwrap(), 1);

    // put takes the value over
    ops.put(users::COLLECTION, &user("u2", "shared@example.com")).await.unwrap();
    let holder: Value = ops
        .get_by_index(users::COLLECTION, users::EMAIL, "shared@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(holder["id"], "u2");
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    ops.put(users::COLLECTION, &user("u1", "a@example.com")).await.unwrap();
    ops.delete(users::COLLECTION, "u1").await.unwrap();
    ops.delete(users::COLLECTION, "u1").await.unwrap();
    ops.delete(users::COLLECTION, "never-existed").await.unwrap();

    let found: Option<Value> = ops.get_by_index(users::COLLECTION, users::EMAIL, "a@example.com").await.unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_key_ranges_filter_get_all_and_count() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    for id in ["a", "b", "c", "d", "e"] {
        ops.put(users::COLLECTION, &user(id, &format!("{id}@example.com"))).await.unwrap();
    }

    let range = KeyRange::bound("b", "d", false, true);
    let rows: Vec<Value> = ops.get_all(users::COLLECTION, Some(range.clone())).await.unwrap();
    let ids: Vec<&str> = rows.iter().filter_map(|row| row["id"].as_str()).collect();
    assert_eq!(ids, ["b", "c"]);
    assert_eq!(ops.count(users::COLLECTION, Some(range)).await.unwrap(), 2);
    assert_eq!(ops.count(users::COLLECTION, Some(KeyRange::only("e"))).await.unwrap(), 1);
    assert_eq!(ops.count(users::COLLECTION, Some(KeyRange::lower_bound("c", true))).await.unwrap(), 2);
}

#[tokio::test]
async fn test_get_all_by_index() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    for (id, conversation) in [("h1", "c1"), ("h2", "c1"), ("h3", "c2")] {
        let highlight = json!({
            "id": id,
            "conversationId": conversation,
            "highlightedText": "text",
            "timeCreated": "2024-01-01T00:00:00Z",
        });
        ops.put(highlights::COLLECTION, &highlight).await.unwrap();
    }

    let rows: Vec<Value> = ops
        .get_all_by_index(highlights::COLLECTION, highlights::CONVERSATION_ID, "c1")
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        ops.count_by_index(highlights::COLLECTION, highlights::CONVERSATION_ID, "c2").await.unwrap(),
        1
    );
    assert_eq!(
        ops.count_by_index(highlights::COLLECTION, highlights::CONVERSATION_ID, "c3").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_index_follows_updates() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    let conversation = |url: &str| json!({"id": "c1", "pageUrl": url, "lastUpdated": "2024-01-01T00:00:00Z"});
    ops.put(conversations::COLLECTION, &conversation("https://a.example")).await.unwrap();
    ops.put(conversations::COLLECTION, &conversation("https://b.example")).await.unwrap();

    let old: Vec<Value> = ops
        .get_all_by_index(conversations::COLLECTION, conversations::PAGE_URL, "https://a.example")
        .await
        .unwrap();
    let new: Vec<Value> = ops
        .get_all_by_index(conversations::COLLECTION, conversations::PAGE_URL, "https://b.example")
        .await
        .unwrap();
    assert!(old.is_empty());
    assert_eq!(new.len(), 1);
}

#[tokio::test]
async fn test_unknown_collection_and_index() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    let err = ops.get::<Value>("bookmarks", "x").await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownCollection(ref name) if name == "bookmarks"));

    let err = ops.get_all_by_index::<Value>(users::COLLECTION, "name", "Ada").await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownIndex { ref index, .. } if index == "name"));
}

#[tokio::test]
async fn test_clear_empties_collection_and_indexes() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    ops.put(users::COLLECTION, &user("u1", "a@example.com")).await.unwrap();
    ops.clear(users::COLLECTION).await.unwrap();

    assert_eq!(ops.count(users::COLLECTION, None).await.unwrap(), 0);
    assert_eq!(ops.count_by_index(users::COLLECTION, users::EMAIL, "a@example.com").await.unwrap(), 0);
    ops.add(users::COLLECTION, &user("u2", "a@example.com")).await.unwrap();
}

#[tokio::test]
async fn test_record_without_primary_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    let err = ops.put(users::COLLECTION, &json!({"email": "a@example.com"})).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));
}

#[tokio::test]
async fn test_integer_keys_past_f64_precision_are_rejected() {
    let dir = TempDir::new().unwrap();
    let ops = operations(&dir);

    // 2^53 and 2^53 + 1 share one f64 value
    let exact = 9_007_199_254_740_991_u64;
    ops.add(users::COLLECTION, &json!({"id": exact, "email": "a@example.com"})).await.unwrap();
    ops.add(users::COLLECTION, &json!({"id": exact - 1, "email": "b@example.com"})).await.unwrap();
    assert_eq!(ops.count(users::COLLECTION, None).await.unwrap(), 2);

    let err = ops
        .add(users::COLLECTION, &json!({"id": 9_007_199_254_740_993_u64, "email": "c@example.com"}))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));

    let err = ops.get::<Value>(users::COLLECTION, 9_007_199_254_740_992_u64).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));
    assert_eq!(ops.count(users::COLLECTION, None).await.unwrap(), 2);
}
