//! In-memory vector index.
//!
//! The reference [`VectorStore`] adapter: fully correct cosine search over
//! per-class maps, suitable for tests and single-process deployments.
//! External engines (Weaviate, pgvector, sqlite-vec) plug in behind the
//! same trait without touching the pipeline.

use std::sync::RwLock;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use uuid::Uuid;

use super::math::cosine_similarity;
use super::{
    NearestHit, NearestQuery, PROP_IMPORTANCE, PROP_USER_ID, VectorClass, VectorError,
    VectorObject, VectorStore,
};

#[derive(Clone, Debug)]
struct StoredObject {
    properties: Value,
    vector: Vec<f32>,
}

/// Process-local vector index keyed by class name.
pub struct InMemoryVectorIndex {
    dim: usize,
    classes: RwLock<FxHashMap<&'static str, FxHashMap<Uuid, StoredObject>>>,
}

impl InMemoryVectorIndex {
    /// Create an index that accepts vectors of exactly `dim` components.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            classes: RwLock::new(FxHashMap::default()),
        }
    }

    /// Number of objects currently held in `class`.
    pub fn count(&self, class: VectorClass) -> usize {
        self.classes
            .read()
            .ok()
            .and_then(|classes| classes.get(class.name()).map(FxHashMap::len))
            .unwrap_or(0)
    }

    fn guard_schema(
        classes: &FxHashMap<&'static str, FxHashMap<Uuid, StoredObject>>,
        class: VectorClass,
    ) -> Result<(), VectorError> {
        if classes.contains_key(class.name()) {
            Ok(())
        } else {
            Err(VectorError::UnknownClass(class.name()))
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorIndex {
    async fn ensure_schema(&self) -> Result<(), VectorError> {
        let mut classes = self
            .classes
            .write()
            .map_err(|_| VectorError::Backend("index lock poisoned".into()))?;
        for class in VectorClass::all() {
            classes.entry(class.name()).or_default();
        }
        Ok(())
    }

    async fn upsert_batch(
        &self,
        class: VectorClass,
        objects: Vec<VectorObject>,
    ) -> Result<(), VectorError> {
        for object in &objects {
            if object.vector.len() != self.dim {
                return Err(VectorError::DimensionMismatch {
                    expected: self.dim,
                    got: object.vector.len(),
                });
            }
        }
        let mut classes = self
            .classes
            .write()
            .map_err(|_| VectorError::Backend("index lock poisoned".into()))?;
        Self::guard_schema(&classes, class)?;
        let entries = classes.entry(class.name()).or_default();
        for object in objects {
            entries.insert(
                object.id,
                StoredObject {
                    properties: object.properties,
                    vector: object.vector,
                },
            );
        }
        Ok(())
    }

    async fn nearest(
        &self,
        class: VectorClass,
        vector: &[f32],
        query: &NearestQuery,
    ) -> Result<Vec<NearestHit>, VectorError> {
        if vector.len() != self.dim {
            return Err(VectorError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        let classes = self
            .classes
            .read()
            .map_err(|_| VectorError::Backend("index lock poisoned".into()))?;
        Self::guard_schema(&classes, class)?;
        let entries = match classes.get(class.name()) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        let mut hits: Vec<NearestHit> = entries
            .iter()
            .filter(|(_, stored)| {
                stored
                    .properties
                    .get(PROP_USER_ID)
                    .and_then(Value::as_str)
                    .is_some_and(|owner| owner == query.user_id)
            })
            .filter(|(_, stored)| match query.min_importance {
                Some(floor) => stored
                    .properties
                    .get(PROP_IMPORTANCE)
                    .and_then(Value::as_f64)
                    .is_some_and(|importance| importance >= floor),
                None => true,
            })
            .filter_map(|(id, stored)| {
                let certainty = cosine_similarity(vector, &stored.vector)?.clamp(0.0, 1.0);
                (certainty >= query.min_certainty).then(|| NearestHit {
                    id: *id,
                    properties: stored.properties.clone(),
                    certainty,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.certainty
                .partial_cmp(&a.certainty)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn fetch(
        &self,
        class: VectorClass,
        id: Uuid,
    ) -> Result<Option<VectorObject>, VectorError> {
        let classes = self
            .classes
            .read()
            .map_err(|_| VectorError::Backend("index lock poisoned".into()))?;
        Self::guard_schema(&classes, class)?;
        Ok(classes.get(class.name()).and_then(|entries| {
            entries.get(&id).map(|stored| VectorObject {
                id,
                properties: stored.properties.clone(),
                vector: stored.vector.clone(),
            })
        }))
    }

    async fn delete_class(&self, class: VectorClass) -> Result<(), VectorError> {
        let mut classes = self
            .classes
            .write()
            .map_err(|_| VectorError::Backend("index lock poisoned".into()))?;
        classes.remove(class.name());
        Ok(())
    }
}
