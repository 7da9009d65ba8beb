//! In-memory vector store.
//!
//! Backs tests and offline development with the same contract as a real
//! cluster: owner-filtered delete and cosine-scored, owner-filtered search.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{IndexPoint, OwnerFilter, SearchHit, VectorStore};

#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Arc<RwLock<HashMap<String, Vec<IndexPoint>>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a collection's points, for assertions.
    pub async fn points(&self, collection: &str) -> Vec<IndexPoint> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, _dimensions: usize) -> anyhow::Result<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> anyhow::Result<()> {
        let mut collections = self.collections.write().await;
        let stored = collections.entry(collection.to_string()).or_default();
        for point in points {
            stored.retain(|p| p.id != point.id);
            stored.push(point);
        }
        Ok(())
    }

    async fn delete_by_owner(&self, collection: &str, filter: &OwnerFilter) -> anyhow::Result<()> {
        let mut collections = self.collections.write().await;
        if let Some(stored) = collections.get_mut(collection) {
            stored.retain(|p| {
                p.payload.user_id != filter.user_id || p.payload.document_id != filter.document_id
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &OwnerFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let collections = self.collections.read().await;
        let Some(stored) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = stored
            .iter()
            .filter(|p| {
                p.payload.user_id == filter.user_id && p.payload.document_id == filter.document_id
            })
            .map(|p| SearchHit {
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
