use crate::{IndexedChunk, ProviderError, ScoredChunk};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// Incremental text fragments produced by a streaming generation call.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;

    /// Providers without native streaming deliver the whole reply as one fragment.
    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError> {
        let text = self.generate(prompt).await?;
        Ok(stream::iter(vec![Ok(text)]).boxed())
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn insert(&mut self, chunks: Vec<IndexedChunk>) -> Result<(), ProviderError>;

    /// Returns at most `k` chunks ordered by descending similarity.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, ProviderError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases backend storage once the index is no longer bound anywhere.
    /// Stores that live only in memory have nothing to release.
    async fn dispose(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
