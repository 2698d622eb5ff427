use crate::chunking::{build_chunks, ChunkingConfig, SourceDocument};
use crate::error::IngestError;
use crate::extractor::{is_supported, DocumentReader};
use crate::models::Chunk;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One file of an upload batch.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
        Ok(Self {
            name: name.to_string(),
            bytes: fs::read(path)?,
        })
    }

    /// Reads `path`, naming it by its location under `root` (`a/notes.txt`)
    /// so equally named files from different folders stay distinct sources.
    pub fn from_path_under(root: &Path, path: &Path) -> Result<Self, IngestError> {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let name = relative
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.join("/"))
            .filter(|name| !name.is_empty())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
        Ok(Self {
            name,
            bytes: fs::read(path)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub chunks: Vec<Chunk>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Lists supported documents under `folder`, recursively and in sorted order.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() && is_supported(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Loads the given paths, expanding directories. Files found in a directory
/// are named relative to it; a name already taken in the batch falls back to
/// the full path. Files that cannot be read are returned as skips rather than
/// failing the whole batch.
pub fn load_paths(paths: &[PathBuf]) -> (Vec<UploadedFile>, Vec<SkippedFile>) {
    let mut files = Vec::new();
    let mut skipped = Vec::new();
    let mut names = HashSet::new();

    let expanded = paths.iter().flat_map(|path| {
        if path.is_dir() {
            discover_documents(path)
                .into_iter()
                .map(|file| (Some(path.as_path()), file))
                .collect::<Vec<_>>()
        } else {
            vec![(None, path.clone())]
        }
    });

    for (root, path) in expanded {
        let loaded = match root {
            Some(root) => UploadedFile::from_path_under(root, &path),
            None => UploadedFile::from_path(&path),
        };
        match loaded {
            Ok(mut file) => {
                if !names.insert(file.name.clone()) {
                    file.name = path.display().to_string();
                    names.insert(file.name.clone());
                }
                files.push(file);
            }
            Err(error) => {
                warn!(path = %path.display(), reason = %error, "could not load file");
                skipped.push(SkippedFile {
                    name: path.display().to_string(),
                    reason: error.to_string(),
                });
            }
        }
    }

    (files, skipped)
}

/// Reads and chunks every file of the batch. A file that cannot be read or
/// has no text yields zero chunks and a skip entry; the rest of the batch
/// is still processed.
pub fn ingest_uploads(
    files: &[UploadedFile],
    reader: &dyn DocumentReader,
    config: ChunkingConfig,
) -> Result<IngestionReport, IngestError> {
    config.validate()?;

    let mut report = IngestionReport::default();

    for file in files {
        let build_result = reader.read(&file.name, &file.bytes).and_then(|raw_text| {
            build_chunks(
                &SourceDocument {
                    source_name: file.name.clone(),
                    raw_text,
                },
                config,
            )
        });

        match build_result {
            Ok(file_chunks) => {
                debug!(file = %file.name, chunk_count = file_chunks.len(), "chunked document");
                report.chunks.extend(file_chunks);
            }
            Err(error) => {
                warn!(file = %file.name, reason = %error, "skipped document");
                report.skipped_files.push(SkippedFile {
                    name: file.name.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }

    Ok(report)
}
