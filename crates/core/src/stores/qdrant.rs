use crate::traits::VectorIndex;
use crate::{Chunk, IndexedChunk, ProviderError, ScoredChunk};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

/// Vector index backed by one Qdrant collection. Each built index gets its
/// own collection so a rebuild never mutates a collection being queried.
pub struct QdrantIndex {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
    points: usize,
}

impl QdrantIndex {
    /// Every request made through the returned index is bounded by `timeout`.
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::builder().timeout(timeout).build()?,
            vector_size,
            points: 0,
        })
    }

    /// Creates a fresh, uniquely named collection under `prefix`.
    pub async fn create(
        endpoint: impl Into<String>,
        prefix: &str,
        vector_size: usize,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let collection = format!("{prefix}-{}", Uuid::new_v4().simple());
        let index = Self::new(endpoint, collection, vector_size, timeout)?;
        index.ensure_collection().await?;
        Ok(index)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    pub async fn ensure_collection(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;
        check_status(&response)
    }

    /// Drops the collection and every point in it.
    pub async fn delete_collection(&self) -> Result<(), ProviderError> {
        let response = self.client.delete(self.collection_url()).send().await?;
        check_status(&response)
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), ProviderError> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(ProviderError::BackendResponse {
        backend: "qdrant".to_string(),
        details: response.status().to_string(),
    })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn insert(&mut self, chunks: Vec<IndexedChunk>) -> Result<(), ProviderError> {
        let points = chunks
            .iter()
            .map(|entry| {
                if entry.embedding.len() != self.vector_size {
                    return Err(ProviderError::DimensionMismatch {
                        expected: self.vector_size,
                        actual: entry.embedding.len(),
                    });
                }

                Ok(json!({
                    "id": point_id(&entry.chunk.chunk_id).to_string(),
                    "vector": entry.embedding,
                    "payload": {
                        "chunk_id": entry.chunk.chunk_id,
                        "source": entry.chunk.source,
                        "position": entry.chunk.position,
                        "text": entry.chunk.text,
                    },
                }))
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check_status(&response)?;

        self.points += points.len();
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, ProviderError> {
        if vector.len() != self.vector_size {
            return Err(ProviderError::DimensionMismatch {
                expected: self.vector_size,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({
                "vector": vector,
                "limit": k,
                "with_payload": true,
            }))
            .send()
            .await?;
        check_status(&response)?;

        let parsed: Value = response.json().await?;
        Ok(parse_search_hits(&parsed))
    }

    fn len(&self) -> usize {
        self.points
    }

    async fn dispose(&self) -> Result<(), ProviderError> {
        self.delete_collection().await
    }
}

fn point_id(chunk_id: &str) -> Uuid {
    let mut bytes = [0u8; 16];
    for (slot, pair) in bytes.iter_mut().zip(chunk_id.as_bytes().chunks(2)) {
        let hex = std::str::from_utf8(pair).unwrap_or("00");
        *slot = u8::from_str_radix(hex, 16).unwrap_or(0);
    }
    Uuid::from_bytes(bytes)
}

fn parse_search_hits(parsed: &Value) -> Vec<ScoredChunk> {
    let hits = parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    hits.iter()
        .map(|hit| {
            let text_field = |name: &str| {
                hit.pointer(&format!("/payload/{name}"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };

            ScoredChunk {
                chunk: Chunk {
                    chunk_id: text_field("chunk_id"),
                    source: text_field("source"),
                    position: hit
                        .pointer("/payload/position")
                        .and_then(Value::as_u64)
                        .map(|position| position as usize),
                    text: text_field("text"),
                },
                score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
            }
        })
        .collect()
}
