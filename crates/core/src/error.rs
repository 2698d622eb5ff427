use crate::ingest::SkippedFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unreadable document {name}: {details}")]
    Unreadable { name: String, details: String },

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("document {0} has no text to index")]
    EmptyDocument(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("vector dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("provider request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ClassificationParseError {
    #[error("classifier output is not a JSON object: {0}")]
    MalformedJson(String),

    #[error("classifier output is missing key `{0}`")]
    MissingKey(&'static str),

    #[error("unknown intent label `{0}`")]
    UnknownIntent(String),

    #[error("confidence is not a number in [0, 1]: {0}")]
    InvalidConfidence(String),
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Parse(#[from] ClassificationParseError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no session with id {0}")]
    UnknownSession(String),

    #[error("upload produced no indexable text ({} file(s) skipped)", skipped.len())]
    NoChunks { skipped: Vec<SkippedFile> },

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
