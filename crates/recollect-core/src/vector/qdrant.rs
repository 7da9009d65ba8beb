//! Qdrant REST client.
//!
//! Speaks the collections/points HTTP API: idempotent collection creation,
//! batched upsert, payload-filtered delete, and payload-filtered similarity
//! search. Retry policy lives in the gateway, not here; every method is one
//! attempt.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{IndexPoint, OwnerFilter, SearchHit, VectorStore};

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantStore {
    pub fn new(base_url: &str, api_key: Option<&str>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Qdrant base URL must be an http(s) URL"
        );
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
        })
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert(
                HeaderName::from_static("api-key"),
                HeaderValue::from_str(key)?,
            );
        }
        Ok(headers)
    }
}

/// Qdrant `must` filter matching both owner payload fields.
fn owner_filter_json(filter: &OwnerFilter) -> serde_json::Value {
    json!({
        "must": [
            { "key": "user_id", "match": { "value": filter.user_id } },
            { "key": "document_id", "match": { "value": filter.document_id } },
        ]
    })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, name: &str, dimensions: usize) -> anyhow::Result<()> {
        let url = format!("{}/collections/{}", self.base_url, name);

        let existing = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;
        if existing.status().is_success() {
            return Ok(());
        }
        if existing.status() != StatusCode::NOT_FOUND {
            anyhow::bail!(
                "Qdrant collection lookup failed ({}): {}",
                existing.status(),
                existing.text().await.unwrap_or_default()
            );
        }

        let body = json!({
            "vectors": { "size": dimensions, "distance": "Cosine" }
        });
        let response = self
            .client
            .put(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => {
                tracing::info!(collection = name, dimensions, "Vector collection ready");
                Ok(())
            }
            status => anyhow::bail!(
                "Qdrant collection create failed ({status}): {}",
                response.text().await.unwrap_or_default()
            ),
        }
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> anyhow::Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let wire: Vec<WirePoint> = points
            .into_iter()
            .map(|p| WirePoint {
                id: p.id.to_string(),
                vector: p.vector,
                payload: serde_json::to_value(&p.payload).unwrap_or_default(),
            })
            .collect();

        let url = format!("{}/collections/{}/points", self.base_url, collection);
        let response = self
            .client
            .put(&url)
            .headers(self.headers()?)
            .query(&[("wait", "true")])
            .json(&json!({ "points": wire }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!(
                "Qdrant upsert failed ({}): {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )
        }
    }

    async fn delete_by_owner(&self, collection: &str, filter: &OwnerFilter) -> anyhow::Result<()> {
        let url = format!("{}/collections/{}/points/delete", self.base_url, collection);
        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .query(&[("wait", "true")])
            .json(&json!({ "filter": owner_filter_json(filter) }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!(
                "Qdrant delete failed ({}): {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )
        }
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &OwnerFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let url = format!("{}/collections/{}/points/search", self.base_url, collection);
        let body = json!({
            "vector": vector,
            "filter": owner_filter_json(filter),
            "limit": limit,
            "with_payload": true,
        });
        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Qdrant search failed ({}): {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }

        let body: SearchResponse = response.json().await?;
        let hits = body
            .result
            .into_iter()
            .filter_map(|entry| {
                let payload = entry.payload?;
                match serde_json::from_value(payload) {
                    Ok(payload) => Some(SearchHit {
                        score: entry.score,
                        payload,
                    }),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping search hit with malformed payload");
                        None
                    }
                }
            })
            .collect();
        Ok(hits)
    }
}

#[derive(Serialize)]
struct WirePoint {
    id: String,
    vector: Vec<f32>,
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchEntry>,
}

#[derive(Deserialize)]
struct SearchEntry {
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}
