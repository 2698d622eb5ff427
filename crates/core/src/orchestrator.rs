use crate::chunking::ChunkingConfig;
use crate::embeddings::Embedder;
use crate::engine::RetrievalEngine;
use crate::error::{ChatError, ProviderError};
use crate::extractor::{DocumentReader, ExtensionReader};
use crate::index::{build_index, DocumentIndex};
use crate::ingest::{ingest_uploads, SkippedFile, UploadedFile};
use crate::models::{ChatOptions, IndexScope, Turn};
use crate::router::{with_timeout, StreamingTurn, TurnOutcome, TurnRouter};
use crate::session::{SessionId, SessionRegistry, SessionSummary};
use crate::stores::{InMemoryIndex, QdrantIndex};
use crate::traits::GenerationProvider;
use std::sync::Arc;
use tracing::{info, warn};

/// Where built indexes live.
#[derive(Debug, Clone, Default)]
pub enum IndexBackend {
    #[default]
    Memory,
    Qdrant {
        url: String,
        collection_prefix: String,
    },
}

#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub session: SessionId,
    pub scope: IndexScope,
    pub chunk_count: usize,
    pub sources: Vec<String>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Ties ingestion, indexing, sessions and routing together.
pub struct DocChat {
    registry: SessionRegistry,
    router: TurnRouter,
    reader: Arc<dyn DocumentReader>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn GenerationProvider>,
    backend: IndexBackend,
    options: ChatOptions,
}

impl DocChat {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn GenerationProvider>,
        options: ChatOptions,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            router: TurnRouter::new(generator.clone(), options.clone()),
            reader: Arc::new(ExtensionReader::default()),
            embedder,
            generator,
            backend: IndexBackend::Memory,
            options,
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn DocumentReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_backend(mut self, backend: IndexBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    /// Ingests an upload batch for the active session.
    pub async fn upload(&self, files: &[UploadedFile]) -> Result<UploadSummary, ChatError> {
        self.upload_to(self.registry.active_id(), files).await
    }

    /// Chunks, embeds and indexes `files`, then binds the new index according
    /// to the configured scope. Unreadable files are skipped; a batch with no
    /// text at all leaves any existing binding in place.
    pub async fn upload_to(
        &self,
        session: SessionId,
        files: &[UploadedFile],
    ) -> Result<UploadSummary, ChatError> {
        // fail fast on a stale id before doing any embedding work
        self.registry.session(session)?;

        let config = ChunkingConfig::from(&self.options);
        let report = ingest_uploads(files, self.reader.as_ref(), config)?;
        if report.chunks.is_empty() {
            return Err(ChatError::NoChunks {
                skipped: report.skipped_files,
            });
        }

        let chunk_count = report.chunks.len();
        let index = self.build(report.chunks).await?;
        let sources = index.sources().to_vec();
        let engine = Arc::new(RetrievalEngine::new(
            index,
            self.embedder.clone(),
            self.generator.clone(),
            &self.options,
        ));

        self.replace_binding(session, engine).await?;

        if !report.skipped_files.is_empty() {
            warn!(
                skipped = report.skipped_files.len(),
                "some uploaded files were not indexed"
            );
        }
        info!(%session, chunk_count, scope = ?self.options.index_scope, "documents indexed");

        Ok(UploadSummary {
            session,
            scope: self.options.index_scope,
            chunk_count,
            sources,
            skipped_files: report.skipped_files,
        })
    }

    /// Binds `engine` according to the configured scope and releases the
    /// index it displaces. A turn still running on a displaced shared index
    /// ends with the failure reply.
    async fn replace_binding(
        &self,
        session: SessionId,
        engine: Arc<RetrievalEngine>,
    ) -> Result<(), ChatError> {
        let replaced = match self.options.index_scope {
            IndexScope::PerSession => self.registry.bind_index(session, engine).await?,
            IndexScope::Shared => self.registry.bind_shared(engine),
        };
        if let Some(previous) = replaced {
            self.retire(previous.index()).await;
        }
        Ok(())
    }

    async fn retire(&self, index: &DocumentIndex) {
        let limit = self.options.provider_timeout;
        if let Err(error) = with_timeout(limit, "index disposal", index.dispose()).await {
            warn!(%error, sources = ?index.sources(), "could not release replaced index");
        }
    }

    async fn build(&self, chunks: Vec<crate::Chunk>) -> Result<DocumentIndex, ProviderError> {
        let limit = self.options.provider_timeout;
        let dimensions = self.embedder.dimensions();
        match &self.backend {
            IndexBackend::Memory => {
                build_index(InMemoryIndex::new(dimensions), chunks, self.embedder.as_ref()).await
            }
            IndexBackend::Qdrant {
                url,
                collection_prefix,
            } => {
                let store =
                    QdrantIndex::create(url.clone(), collection_prefix, dimensions, limit).await?;
                let collection = store.collection().to_string();
                match build_index(store, chunks, self.embedder.as_ref()).await {
                    Ok(index) => Ok(index),
                    Err(error) => {
                        // the half-filled collection is never bound, drop it now
                        let orphan = QdrantIndex::new(url.clone(), collection, dimensions, limit)?;
                        if let Err(cleanup) = orphan.delete_collection().await {
                            warn!(
                                error = %cleanup,
                                collection = orphan.collection(),
                                "could not drop unfinished collection"
                            );
                        }
                        Err(error)
                    }
                }
            }
        }
    }

    /// Routes one message on the active session.
    pub async fn ask(&self, utterance: &str) -> Result<TurnOutcome, ChatError> {
        self.ask_in(self.registry.active_id(), utterance).await
    }

    pub async fn ask_in(
        &self,
        session: SessionId,
        utterance: &str,
    ) -> Result<TurnOutcome, ChatError> {
        let handle = self.registry.session(session)?;
        let mut session = handle.lock().await;
        let engine = self.registry.engine_for(&session);
        Ok(self.router.handle(&mut session, engine, utterance).await)
    }

    /// Routes one message on the active session and streams the reply.
    pub async fn ask_streaming(&self, utterance: &str) -> Result<StreamingTurn, ChatError> {
        let handle = self.registry.session(self.registry.active_id())?;
        let session = handle.lock_owned().await;
        let engine = self.registry.engine_for(&session);
        Ok(self.router.handle_streaming(session, engine, utterance).await)
    }

    /// Creates a session and makes it active.
    pub fn new_session(&self) -> SessionId {
        let id = self.registry.create_session();
        // the id was just created, so switching cannot fail
        let _ = self.registry.switch(id);
        id
    }

    pub fn switch_session(&self, id: SessionId) -> Result<(), ChatError> {
        self.registry.switch(id)
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.registry.list_sessions()
    }

    pub async fn history(&self, id: SessionId) -> Result<Vec<Turn>, ChatError> {
        self.registry.history(id).await
    }

    /// True when a turn on `id` would have documents to answer from.
    pub async fn has_documents(&self, id: SessionId) -> Result<bool, ChatError> {
        let handle = self.registry.session(id)?;
        let session = handle.lock().await;
        Ok(self.registry.engine_for(&session).is_some())
    }
}
