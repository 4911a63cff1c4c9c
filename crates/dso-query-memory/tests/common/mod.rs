#![allow(dead_code)]

use dso_query::{
    EntityRecord, FilterScope, ListResponse, QueryConfig, QueryEngine, QueryParams, Result,
    SchemaRegistry, TableKey,
};
use dso_query_memory::{MemoryBackend, MemorySchemaSource};
use futures::TryStreamExt;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dso_query=debug,dso_query_memory=debug")
        .with_test_writer()
        .try_init();
}

pub struct Fixture {
    pub source: Arc<MemorySchemaSource>,
    pub backend: Arc<MemoryBackend>,
    pub engine: Arc<QueryEngine>,
}

pub fn gebieden() -> Value {
    json!({
        "id": "gebieden",
        "type": "dataset",
        "tables": [
            {
                "id": "stadsdelen",
                "schema": {
                    "properties": {
                        "id": {"type": "integer"},
                        "naam": {"type": "string"}
                    }
                }
            },
            {
                "id": "wijken",
                "temporal": {
                    "identifier": "volgnummer",
                    "dimensions": {"geldigOp": ["beginGeldigheid", "eindGeldigheid"]}
                },
                "schema": {
                    "identifier": ["identificatie", "volgnummer"],
                    "properties": {
                        "identificatie": {"type": "string"},
                        "volgnummer": {"type": "integer"},
                        "naam": {"type": "string"},
                        "beginGeldigheid": {"type": "string", "format": "date"},
                        "eindGeldigheid": {"type": "string", "format": "date"},
                        "ligtInStadsdeel": {"type": "integer", "relation": "gebieden:stadsdelen"}
                    }
                }
            },
            {
                "id": "buurten",
                "schema": {
                    "properties": {
                        "id": {"type": "integer"},
                        "naam": {"type": "string"},
                        "code": {"type": "string", "auth": "FP/MDW"},
                        "stadsdeel": {"type": "integer", "relation": "gebieden:stadsdelen"},
                        "ligtInWijk": {
                            "type": "object",
                            "relation": "gebieden:wijken",
                            "properties": {
                                "identificatie": {"type": "string"},
                                "volgnummer": {"type": "integer"}
                            }
                        },
                        "vorigeWijk": {"type": "string", "relation": "wijken", "auth": "FP/MDW"}
                    }
                }
            },
            {
                "id": "versies",
                "temporal": {"identifier": "volgnummer"},
                "schema": {
                    "identifier": ["code", "volgnummer"],
                    "properties": {
                        "code": {"type": "string"},
                        "volgnummer": {"type": "integer"},
                        "naam": {"type": "string"}
                    }
                }
            }
        ]
    })
}

pub fn bag() -> Value {
    json!({
        "id": "bag",
        "tables": [{
            "id": "panden",
            "schema": {"properties": {"id": {"type": "integer"}}}
        }]
    })
}

pub fn geheim() -> Value {
    json!({
        "id": "geheim",
        "auth": "GEHEIM",
        "tables": [{
            "id": "dossiers",
            "schema": {"properties": {"id": {"type": "integer"}}}
        }]
    })
}

/// Refers to `wijken` across datasets, so by identifier without being loose
pub fn meldingen() -> Value {
    json!({
        "id": "meldingen",
        "tables": [{
            "id": "meldingen",
            "schema": {
                "properties": {
                    "id": {"type": "integer"},
                    "wijk": {"type": "string", "relation": "gebieden:wijken"}
                }
            }
        }]
    })
}

pub fn key(dataset: &str, table: &str) -> TableKey {
    TableKey::new(dataset, table)
}

impl Fixture {
    /// Every dataset loaded, `panden` holding `panden` rows
    pub async fn new(panden: usize) -> Fixture {
        init_tracing();
        let source = Arc::new(MemorySchemaSource::new());
        for document in [gebieden(), bag(), geheim(), meldingen()] {
            source.insert(document).await.unwrap();
        }
        let registry = SchemaRegistry::load(source.clone()).await.unwrap();
        let backend = Arc::new(MemoryBackend::new());

        let tables: Vec<(TableKey, Vec<Value>)> = vec![
            (
                key("gebieden", "stadsdelen"),
                vec![
                    json!({"id": 5, "naam": "Oost"}),
                    json!({"id": 7, "naam": "West"}),
                    json!({"id": 9, "naam": "Zuid"}),
                ],
            ),
            (
                key("gebieden", "wijken"),
                vec![
                    json!({"identificatie": "W1", "volgnummer": 1, "naam": "Centrum",
                        "beginGeldigheid": "2019-01-01", "eindGeldigheid": "2021-01-01", "ligtInStadsdeel": 5}),
                    json!({"identificatie": "W1", "volgnummer": 2, "naam": "Centrum-Oost",
                        "beginGeldigheid": "2021-01-01", "eindGeldigheid": null, "ligtInStadsdeel": 5}),
                    json!({"identificatie": "W2", "volgnummer": 1, "naam": "Noord",
                        "beginGeldigheid": "2018-01-01", "eindGeldigheid": "2020-06-01", "ligtInStadsdeel": 7}),
                ],
            ),
            (
                key("gebieden", "buurten"),
                vec![
                    json!({"id": 1, "naam": "Oosterpark", "code": "A1", "stadsdeel": 5,
                        "ligtInWijk": {"identificatie": "W1", "volgnummer": 1}, "vorigeWijk": "W2"}),
                    json!({"id": 2, "naam": "Westerpark", "code": "B2", "stadsdeel": 7,
                        "ligtInWijk": {"identificatie": "W1", "volgnummer": 2}, "vorigeWijk": null}),
                    json!({"id": 3, "naam": "Oostelijk Havengebied", "code": "C3", "stadsdeel": 5,
                        "ligtInWijk": {"identificatie": "W2", "volgnummer": 1}, "vorigeWijk": null}),
                ],
            ),
            (
                key("gebieden", "versies"),
                vec![
                    json!({"code": "V1", "volgnummer": 1, "naam": "a"}),
                    json!({"code": "V1", "volgnummer": 3, "naam": "c"}),
                    json!({"code": "V1", "volgnummer": 2, "naam": "b"}),
                    json!({"code": "V2", "volgnummer": 1, "naam": "x"}),
                ],
            ),
            (
                key("bag", "panden"),
                (1..=panden).map(|id| json!({"id": id})).collect(),
            ),
            (key("geheim", "dossiers"), vec![json!({"id": 1})]),
            (
                key("meldingen", "meldingen"),
                vec![json!({"id": 1, "wijk": "W1"}), json!({"id": 2, "wijk": "W2"})],
            ),
        ];

        let snapshot = registry.current().await;
        for (table, rows) in tables {
            let model = snapshot.model_for(&table).unwrap().clone();
            backend.insert_table(model, rows).await.unwrap();
        }
        drop(snapshot);

        let engine = QueryEngine::new(registry, backend.clone(), QueryConfig::default());
        Fixture {
            source,
            backend,
            engine: Arc::new(engine),
        }
    }

    pub async fn list(
        &self,
        table: TableKey,
        query: &str,
        scopes: &FilterScope,
    ) -> Result<ListResponse> {
        let params = QueryParams::parse(query)?;
        self.engine.list(&table, &params, scopes).await
    }
}

/// Drain the page of a list response
pub async fn items(response: &mut ListResponse) -> Result<Vec<EntityRecord>> {
    match response.page.take_items() {
        Some(items) => items.try_collect().await,
        None => Ok(Vec::new()),
    }
}

pub fn field(records: &[EntityRecord], name: &str) -> Vec<Value> {
    records
        .iter()
        .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
        .collect()
}
