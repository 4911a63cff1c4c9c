use crate::error::{QueryError, Result};
use crate::model::{EntityModelFactory, EntityTypeDescriptor, ModelLookup, SkippedTable};
use crate::schema::{DatasetSchema, TableKey};
use crate::traits::SchemaSource;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

/// Immutable view of every loaded dataset and its entity models
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    /// Increases by one on every successful reload
    pub version: u64,
    pub datasets: Vec<Arc<DatasetSchema>>,
    pub models: HashMap<TableKey, Arc<EntityTypeDescriptor>>,
    /// Tables left out because their schema could not be mapped
    pub skipped: Vec<SkippedTable>,
}

impl SchemaSnapshot {
    pub fn dataset(&self, id: &str) -> Option<&Arc<DatasetSchema>> {
        self.datasets.iter().find(|d| d.id == id)
    }

    /// Model of a table, `NotFound` when it is not served
    pub fn model_for(&self, key: &TableKey) -> Result<&Arc<EntityTypeDescriptor>> {
        self.models
            .get(key)
            .ok_or_else(|| QueryError::not_found(format!("table {} does not exist", key)))
    }
}

impl ModelLookup for SchemaSnapshot {
    fn model(&self, key: &TableKey) -> Option<&Arc<EntityTypeDescriptor>> {
        self.models.get(key)
    }
}

/// Holds the active schema snapshot and replaces it on reload.
///
/// Requests pin the snapshot for their whole lifetime. A reload builds the
/// new snapshot without holding the lock, then waits for pinned requests to
/// finish before swapping; requests arriving meanwhile queue behind it.
#[derive(Clone)]
pub struct SchemaRegistry {
    source: Arc<dyn SchemaSource>,
    current: Arc<RwLock<Arc<SchemaSnapshot>>>,
}

impl SchemaRegistry {
    /// Registry with an empty snapshot; call [`SchemaRegistry::reload`] to populate
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            current: Arc::new(RwLock::new(Arc::new(SchemaSnapshot::default()))),
        }
    }

    /// Create and load the initial snapshot
    pub async fn load(source: Arc<dyn SchemaSource>) -> Result<Self> {
        let registry = Self::new(source);
        registry.reload().await?;
        Ok(registry)
    }

    /// The active snapshot, without pinning it
    pub async fn current(&self) -> Arc<SchemaSnapshot> {
        self.current.read().await.clone()
    }

    /// Pin the active snapshot until the returned handle is dropped
    pub async fn pin(&self) -> PinnedSchema {
        let guard = self.current.clone().read_owned().await;
        PinnedSchema {
            lock: self.current.clone(),
            guard,
        }
    }

    /// Load every dataset from the source and swap in the new snapshot.
    ///
    /// A dataset that fails to load aborts the reload and keeps the previous
    /// snapshot; a table that fails to map is skipped.
    pub async fn reload(&self) -> Result<Arc<SchemaSnapshot>> {
        let ids = self.source.dataset_ids().await?;
        let mut datasets = Vec::with_capacity(ids.len());
        for id in &ids {
            let dataset = self.source.load(id).await?;
            debug!("Loaded dataset {} with {} tables", id, dataset.tables.len());
            datasets.push(Arc::new(dataset));
        }

        let models = EntityModelFactory::build_all(&datasets);
        for skipped in &models.skipped {
            warn!("Table {} left out of schema: {}", skipped.key, skipped.error);
        }

        let mut current = self.current.write().await;
        let snapshot = Arc::new(SchemaSnapshot {
            version: current.version + 1,
            datasets,
            models: models.models,
            skipped: models.skipped,
        });
        *current = snapshot.clone();
        info!(
            "Schema snapshot {} active: {} tables, {} skipped",
            snapshot.version,
            snapshot.models.len(),
            snapshot.skipped.len()
        );
        Ok(snapshot)
    }
}

/// A snapshot held for the duration of one request
pub struct PinnedSchema {
    lock: Arc<RwLock<Arc<SchemaSnapshot>>>,
    guard: OwnedRwLockReadGuard<Arc<SchemaSnapshot>>,
}

impl PinnedSchema {
    pub fn snapshot(&self) -> &Arc<SchemaSnapshot> {
        &self.guard
    }

    /// Move to the newest snapshot, provided `table` still exists there
    pub async fn revalidate(self, table: &TableKey) -> Result<PinnedSchema> {
        let PinnedSchema { lock, guard } = self;
        let previous = guard.version;
        drop(guard);

        let guard = lock.clone().read_owned().await;
        if !guard.models.contains_key(table) {
            return Err(QueryError::not_found(format!(
                "table {} no longer exists (schema {})",
                table, guard.version
            )));
        }
        if guard.version != previous {
            debug!("Request moved from schema {} to {}", previous, guard.version);
        }
        Ok(PinnedSchema { lock, guard })
    }
}

impl Deref for PinnedSchema {
    type Target = SchemaSnapshot;

    fn deref(&self) -> &SchemaSnapshot {
        &self.guard
    }
}
