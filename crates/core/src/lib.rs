pub mod chunking;
pub mod classifier;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod history;
pub mod index;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod router;
pub mod session;
pub mod stores;
pub mod traits;

pub use chunking::{build_chunks, split_text, ChunkingConfig, SourceDocument};
pub use classifier::{parse_classification, IntentClassifier};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_OPENAI_EMBEDDING_MODEL,
};
pub use engine::{AnswerEvent, AnswerStream, RetrievalEngine};
pub use error::{ChatError, ClassificationParseError, ClassifyError, IngestError, ProviderError};
pub use extractor::{DocumentReader, DocxReader, ExtensionReader, PlainTextReader};
pub use generation::{OpenAiGenerator, DEFAULT_CHAT_MODEL};
pub use history::HistoryCompactor;
pub use index::{build_index, DocumentIndex};
pub use ingest::{
    discover_documents, ingest_uploads, load_paths, IngestionReport, SkippedFile, UploadedFile,
};
pub use models::{
    Answer, ChatOptions, Chunk, Classification, Evidence, IndexScope, IndexedChunk, Intent, Role,
    Route, ScoredChunk, Turn,
};
pub use orchestrator::{DocChat, IndexBackend, UploadSummary};
pub use router::{StreamingTurn, TurnEvent, TurnOutcome, TurnRouter};
pub use session::{Session, SessionId, SessionRegistry, SessionSummary};
pub use stores::{InMemoryIndex, QdrantIndex};
pub use traits::{FragmentStream, GenerationProvider, VectorIndex};
