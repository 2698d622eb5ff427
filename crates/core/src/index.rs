use crate::embeddings::Embedder;
use crate::traits::VectorIndex;
use crate::{Chunk, IndexedChunk, ProviderError, ScoredChunk};
use std::sync::Arc;
use tracing::info;

const EMBEDDING_BATCH_SIZE: usize = 64;

/// A fully built, read-only similarity index over one upload batch.
///
/// Rebuilding on every upload keeps invalidation trivial at the cost of
/// re-embedding everything; the backend still accepts incremental inserts
/// if that trade-off is revisited.
#[derive(Clone)]
pub struct DocumentIndex {
    store: Arc<dyn VectorIndex>,
    sources: Vec<String>,
}

impl DocumentIndex {
    pub async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, ProviderError> {
        self.store.query(vector, k).await
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Distinct source names, in upload order.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Releases the backing store. Only call this once no session can reach
    /// the index any more.
    pub async fn dispose(&self) -> Result<(), ProviderError> {
        self.store.dispose().await
    }
}

impl std::fmt::Debug for DocumentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentIndex")
            .field("chunks", &self.len())
            .field("sources", &self.sources)
            .finish()
    }
}

/// Embeds every chunk and loads the pairs into `store`, which is then frozen.
pub async fn build_index<I>(
    mut store: I,
    chunks: Vec<Chunk>,
    embedder: &dyn Embedder,
) -> Result<DocumentIndex, ProviderError>
where
    I: VectorIndex + 'static,
{
    let mut sources: Vec<String> = Vec::new();
    for chunk in &chunks {
        if !sources.contains(&chunk.source) {
            sources.push(chunk.source.clone());
        }
    }

    let chunk_count = chunks.len();
    let mut remaining = chunks.into_iter().peekable();
    while remaining.peek().is_some() {
        let batch: Vec<Chunk> = remaining.by_ref().take(EMBEDDING_BATCH_SIZE).collect();
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts).await?;

        if embeddings.len() != batch.len() {
            return Err(ProviderError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                embeddings.len(),
                batch.len()
            )));
        }

        let indexed = batch
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk { chunk, embedding })
            .collect();
        store.insert(indexed).await?;
    }

    info!(
        chunk_count,
        source_count = sources.len(),
        "built document index"
    );

    Ok(DocumentIndex {
        store: Arc::new(store),
        sources,
    })
}
