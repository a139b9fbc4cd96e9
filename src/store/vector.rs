//! In-memory vector index over the store's embedding table.
//!
//! Brute-force cosine over a memvdb collection; fine for the catalog sizes
//! this system sees (thousands of entries, ≤10^5 by contract).

use crate::error::{PmlError, Result};
use memvdb::{CacheDB, Distance, Embedding};
use std::collections::HashMap;

const VECTORS_COLLECTION: &str = "pml_vectors";

#[derive(Debug)]
pub struct VectorIndex {
    db: CacheDB,
    /// Authoritative id → vector map; the memvdb collection is rebuilt from
    /// it on mutation so upserts and removals stay exact.
    entries: HashMap<String, Vec<f32>>,
    dimension: usize,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Result<Self> {
        let mut db = CacheDB::new();
        db.create_collection(VECTORS_COLLECTION.to_string(), dimension, Distance::Cosine)
            .map_err(|e| PmlError::internal(format!("vector collection init failed: {e}")))?;
        Ok(Self {
            db,
            entries: HashMap::new(),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Vec<f32>> {
        self.entries.get(id)
    }

    pub fn upsert(&mut self, id: &str, vector: Vec<f32>) -> Result<()> {
        self.validate(&vector)?;
        self.entries.insert(id.to_string(), vector);
        self.rebuild_collection()
    }

    pub fn upsert_batch(&mut self, batch: Vec<(String, Vec<f32>)>) -> Result<()> {
        for (_, vector) in &batch {
            self.validate(vector)?;
        }
        self.entries.extend(batch);
        self.rebuild_collection()
    }

    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let removed = self.entries.remove(id).is_some();
        if removed {
            self.rebuild_collection()?;
        }
        Ok(removed)
    }

    /// Dense nearest neighbors: unit-norm vectors make cosine a dot product.
    /// Results are sorted (score desc, id asc) and cut at `min_sim`.
    pub fn top_k(&self, query: &[f32], k: usize, min_sim: f32) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimension {
            return Err(PmlError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let Some(collection) = self.db.get_collection(VECTORS_COLLECTION) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(String, f32)> = collection
            .get_similarity(query, k.max(self.entries.len()))
            .into_iter()
            .filter_map(|result| {
                let id = result.embedding.id.get("id")?.clone();
                Some((id, result.score))
            })
            .filter(|(_, score)| *score >= min_sim)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn validate(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(PmlError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if (norm - 1.0).abs() > 1e-3 {
            return Err(PmlError::invalid(format!(
                "embedding is not unit-norm (‖v‖ = {norm:.6})"
            )));
        }
        Ok(())
    }

    fn rebuild_collection(&mut self) -> Result<()> {
        let mut db = CacheDB::new();
        db.create_collection(VECTORS_COLLECTION.to_string(), self.dimension, Distance::Cosine)
            .map_err(|e| PmlError::internal(format!("vector collection init failed: {e}")))?;
        for (id, vector) in &self.entries {
            let embedding = Embedding {
                id: HashMap::from([("id".to_string(), id.clone())]),
                vector: vector.clone(),
                metadata: None,
            };
            db.insert_into_collection(VECTORS_COLLECTION, embedding)
                .map_err(|e| PmlError::internal(format!("vector insert failed: {e}")))?;
        }
        self.db = db;
        Ok(())
    }
}
