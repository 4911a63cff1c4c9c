mod common;

use common::{bag, items, key, Fixture};
use dso_query::{FilterScope, QueryError, SchemaSource};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_source_lists_and_loads_documents() {
    let fixture = Fixture::new(0).await;
    let ids = fixture.source.dataset_ids().await.unwrap();
    assert_eq!(ids, vec!["bag", "gebieden", "geheim", "meldingen"]);

    let dataset = fixture.source.load("bag").await.unwrap();
    assert_eq!(dataset.tables.len(), 1);

    let err = fixture.source.load("brk").await.unwrap_err();
    assert!(matches!(err, QueryError::NotFound(_)));

    let err = fixture.source.insert(json!({"tables": []})).await.unwrap_err();
    assert!(matches!(err, QueryError::Serialization(_)));
}

#[tokio::test]
async fn test_reload_waits_for_running_request() {
    let fixture = Fixture::new(5).await;
    let before = fixture.engine.registry().current().await.version;

    let mut response = fixture
        .list(key("bag", "panden"), "", &FilterScope::anonymous())
        .await
        .unwrap();
    assert_eq!(response.schema().version, before);

    let mut document = bag();
    document["tables"]
        .as_array_mut()
        .unwrap()
        .push(json!({"id": "verblijfsobjecten", "schema": {"properties": {"id": {"type": "integer"}}}}));
    fixture.source.insert(document).await.unwrap();

    let engine = fixture.engine.clone();
    let reload = tokio::spawn(async move { engine.reload().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reload.is_finished());

    // the pinned snapshot stays usable
    assert_eq!(items(&mut response).await.unwrap().len(), 5);
    assert!(response.schema().model_for(&key("bag", "verblijfsobjecten")).is_err());
    drop(response);

    let snapshot = reload.await.unwrap().unwrap();
    assert_eq!(snapshot.version, before + 1);
    assert!(snapshot.model_for(&key("bag", "verblijfsobjecten")).is_ok());
}

#[tokio::test]
async fn test_revalidate_after_table_removed() {
    let fixture = Fixture::new(0).await;
    let registry = fixture.engine.registry().clone();
    let pinned = registry.pin().await;

    assert!(fixture.source.remove("geheim").await);
    let reloading = registry.clone();
    let reload = tokio::spawn(async move { reloading.reload().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = pinned
        .revalidate(&key("geheim", "dossiers"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, QueryError::NotFound(_)));
    reload.await.unwrap().unwrap();

    let pinned = registry.pin().await;
    let pinned = pinned.revalidate(&key("bag", "panden")).await.unwrap();
    assert!(pinned.dataset("geheim").is_none());
}

#[tokio::test]
async fn test_failed_reload_keeps_snapshot() {
    let fixture = Fixture::new(0).await;
    let before = fixture.engine.registry().current().await;

    fixture
        .source
        .insert(json!({"id": "kapot", "type": "catalog", "tables": []}))
        .await
        .unwrap();
    let err = fixture.engine.reload().await.unwrap_err();
    assert!(matches!(err, QueryError::Serialization(_)));

    let after = fixture.engine.registry().current().await;
    assert_eq!(after.version, before.version);
    assert!(after.model_for(&key("gebieden", "buurten")).is_ok());
}

#[tokio::test]
async fn test_unmappable_table_is_skipped() {
    let fixture = Fixture::new(0).await;
    fixture
        .source
        .insert(json!({
            "id": "mix",
            "tables": [
                {"id": "goed", "schema": {"properties": {"id": {"type": "integer"}}}},
                {"id": "fout", "schema": {"properties": {"naam": {"type": "string"}}}}
            ]
        }))
        .await
        .unwrap();

    let snapshot = fixture.engine.reload().await.unwrap();
    assert!(snapshot.model_for(&key("mix", "goed")).is_ok());
    assert!(matches!(
        snapshot.model_for(&key("mix", "fout")),
        Err(QueryError::NotFound(_))
    ));
    assert_eq!(snapshot.skipped.len(), 1);
}

#[tokio::test]
async fn test_malformed_table_declaration_is_skipped() {
    let fixture = Fixture::new(0).await;
    fixture
        .source
        .insert(json!({
            "id": "g",
            "tables": [
                {
                    "id": "bad",
                    "additionalFilters": {"x": {"type": "exotic", "start": "a", "end": "b"}},
                    "schema": {"properties": {"id": {"type": "integer"}}}
                },
                {"id": "good", "schema": {"properties": {"id": {"type": "integer"}}}}
            ]
        }))
        .await
        .unwrap();

    let snapshot = fixture.engine.reload().await.unwrap();
    assert!(snapshot.model_for(&key("g", "good")).is_ok());
    assert!(snapshot.model_for(&key("g", "bad")).is_err());
    let skipped: Vec<_> = snapshot.skipped.iter().map(|s| s.key.clone()).collect();
    assert_eq!(skipped, vec![key("g", "bad")]);
    assert!(snapshot.model_for(&key("gebieden", "buurten")).is_ok());
}
