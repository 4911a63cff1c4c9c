mod common;

use async_trait::async_trait;
use common::{field, items, key, Fixture};
use dso_query::{
    EntityRecord, EntityTypeDescriptor, ExternalFetcher, FilterScope, ObjectId, Predicate,
    QueryEngine, QueryError, QueryParams, Result,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn names(groups: &[dso_query::EmbeddedGroup]) -> Vec<&str> {
    groups.iter().map(|g| g.field.as_str()).collect()
}

#[tokio::test]
async fn test_repeated_references_fetched_once() {
    let fixture = Fixture::new(0).await;
    let mut response = fixture
        .list(key("gebieden", "buurten"), "_expandScope=stadsdeel", &FilterScope::anonymous())
        .await
        .unwrap();

    // nothing is fetched before the page was consumed
    assert_eq!(response.embedded.collector().observed(), 0);
    let records = items(&mut response).await.unwrap();
    assert_eq!(field(&records, "stadsdeel"), vec![json!(5), json!(7), json!(5)]);
    assert_eq!(response.embedded.collector().observed(), 3);

    let groups = response.embedded.fetch().await.unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.field, "stadsdeel");
    assert_eq!(group.table, key("gebieden", "stadsdelen"));

    let ids: Vec<&str> = group.ids().map(ObjectId::as_str).collect();
    assert_eq!(ids, vec!["5", "7", "5"]);
    let embedded: Vec<_> = group
        .records()
        .map(|r| r.and_then(|r| r.get("naam")).cloned())
        .collect();
    assert_eq!(
        embedded,
        vec![Some(json!("Oost")), Some(json!("West")), Some(json!("Oost"))]
    );
    assert_eq!(group.for_source(2).count(), 1);

    let queries = fixture.backend.stats().queries_for(&key("gebieden", "stadsdelen"));
    assert_eq!(queries.len(), 1);
    match &queries[0].predicate {
        Predicate::In { values, .. } => assert_eq!(values, &vec![json!(5), json!(7)]),
        other => panic!("unexpected predicate {:?}", other),
    }
}

#[tokio::test]
async fn test_composite_relation_embeds_exact_versions() {
    let fixture = Fixture::new(0).await;
    let mut response = fixture
        .list(key("gebieden", "buurten"), "_expandScope=ligtInWijk", &FilterScope::anonymous())
        .await
        .unwrap();
    items(&mut response).await.unwrap();

    let groups = response.embedded.fetch().await.unwrap();
    let embedded: Vec<_> = groups[0]
        .records()
        .map(|r| r.and_then(|r| r.get("naam")).cloned())
        .collect();
    assert_eq!(
        embedded,
        vec![
            Some(json!("Centrum")),
            Some(json!("Centrum-Oost")),
            Some(json!("Noord"))
        ]
    );
}

#[tokio::test]
async fn test_loose_relation_resolves_current_version() {
    let fixture = Fixture::new(0).await;
    let scopes = FilterScope::new(["FP/MDW"]);
    let mut response = fixture
        .list(key("gebieden", "buurten"), "_expandScope=vorigeWijk", &scopes)
        .await
        .unwrap();
    items(&mut response).await.unwrap();

    let groups = response.embedded.fetch().await.unwrap();
    // W2 has no version valid today
    assert_eq!(groups[0].len(), 1);
    assert!(groups[0].entries[0].record.is_none());
    assert_eq!(groups[0].entries[0].id.as_str(), "W2");
}

#[tokio::test]
async fn test_wildcard_expand_skips_forbidden_relations() {
    let fixture = Fixture::new(0).await;
    let buurten = key("gebieden", "buurten");

    let mut response = fixture
        .list(buurten.clone(), "_expand=true", &FilterScope::anonymous())
        .await
        .unwrap();
    items(&mut response).await.unwrap();
    let groups = response.embedded.fetch().await.unwrap();
    assert_eq!(names(&groups), vec!["stadsdeel", "ligtInWijk"]);

    let mut response = fixture
        .list(buurten.clone(), "_expand=true", &FilterScope::new(["FP/MDW"]))
        .await
        .unwrap();
    items(&mut response).await.unwrap();
    let groups = response.embedded.fetch().await.unwrap();
    assert_eq!(names(&groups), vec!["stadsdeel", "ligtInWijk", "vorigeWijk"]);

    // naming a forbidden relation is an error
    let err = fixture
        .list(buurten.clone(), "_expandScope=vorigeWijk", &FilterScope::anonymous())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, QueryError::PermissionDenied { ref subject, .. } if subject == "vorigeWijk"));

    let err = fixture
        .list(buurten, "_expandScope=naam", &FilterScope::anonymous())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, QueryError::Validation { .. }));
}

#[tokio::test]
async fn test_without_expand_nothing_is_embedded() {
    let fixture = Fixture::new(0).await;
    let mut response = fixture
        .list(key("gebieden", "buurten"), "_expand=false", &FilterScope::anonymous())
        .await
        .unwrap();
    items(&mut response).await.unwrap();
    assert!(response.embedded.is_empty());
    assert!(response.embedded.fetch().await.unwrap().is_empty());
    assert_eq!(fixture.backend.stats().executions(), 1);
}

#[tokio::test]
async fn test_detail_embeds_relations() {
    let fixture = Fixture::new(0).await;
    let params = QueryParams::new().with("_expandScope", "ligtInWijk,stadsdeel");
    let detail = fixture
        .engine
        .detail(&key("gebieden", "buurten"), "3", &params, &FilterScope::anonymous())
        .await
        .unwrap();

    assert_eq!(detail.record.get("naam"), Some(&json!("Oostelijk Havengebied")));
    assert_eq!(names(&detail.embedded), vec!["ligtInWijk", "stadsdeel"]);
    let wijk = detail.embedded[0].entries[0].record.as_ref().unwrap();
    assert_eq!(wijk.get("naam"), Some(&json!("Noord")));
    let stadsdeel = detail.embedded[1].entries[0].record.as_ref().unwrap();
    assert_eq!(stadsdeel.get("naam"), Some(&json!("Oost")));
}

struct Remote {
    calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ExternalFetcher for Remote {
    async fn fetch(
        &self,
        table: &Arc<EntityTypeDescriptor>,
        ids: &[ObjectId],
    ) -> Result<Vec<EntityRecord>> {
        self.calls
            .lock()
            .unwrap()
            .push(ids.iter().map(|id| id.as_str().to_string()).collect());
        Ok(ids
            .iter()
            .filter(|id| id.as_str() != "7")
            .map(|id| {
                let row = [
                    ("id".to_string(), json!(id.as_str().parse::<i64>().unwrap())),
                    ("naam".to_string(), json!("extern")),
                ];
                EntityRecord::from_row(table.clone(), row.into_iter().collect())
            })
            .collect())
    }
}

#[tokio::test]
async fn test_external_fetcher_replaces_backend_lookup() {
    let fixture = Fixture::new(0).await;
    let remote = Arc::new(Remote {
        calls: Mutex::new(Vec::new()),
    });

    let mut engine = QueryEngine::new(
        fixture.engine.registry().clone(),
        fixture.backend.clone(),
        fixture.engine.config().clone(),
    );
    engine.register_fetcher(key("gebieden", "buurten"), "stadsdeel", remote.clone());

    let params = QueryParams::new().with("_expandScope", "stadsdeel");
    let mut response = engine
        .list(&key("gebieden", "buurten"), &params, &FilterScope::anonymous())
        .await
        .unwrap();
    items(&mut response).await.unwrap();
    let groups = response.embedded.fetch().await.unwrap();

    assert_eq!(*remote.calls.lock().unwrap(), vec![vec!["5".to_string(), "7".to_string()]]);
    let found: Vec<bool> = groups[0].records().map(|r| r.is_some()).collect();
    assert_eq!(found, vec![true, false, true]);
    assert!(fixture
        .backend
        .stats()
        .queries_for(&key("gebieden", "stadsdelen"))
        .is_empty());
}
