use crate::error::{IngestError, Result};
use crate::models::{ChatOptions, Chunk};
use sha2::{Digest, Sha256};

/// Break points tried in order before falling back to a hard character cut.
const SEPARATORS: [&str; 6] = ["\n\n", "\n", ". ", "? ", "! ", " "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig::from(&ChatOptions::default())
    }
}

impl From<&ChatOptions> for ChunkingConfig {
    fn from(value: &ChatOptions) -> Self {
        Self {
            max_chars: value.chunk_max_chars,
            overlap_chars: value.chunk_overlap_chars,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max size {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Raw text of one uploaded document together with the name it was uploaded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub source_name: String,
    pub raw_text: String,
}

/// Splits `text` into windows of at most `max_chars` characters where each
/// window starts exactly `overlap_chars` characters before the previous one
/// ended. Window ends prefer paragraph, line, sentence and word boundaries in
/// that order, but never fall in the first half of a window.
pub fn split_text(text: &str, config: ChunkingConfig) -> Result<Vec<String>> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let mut windows = Vec::new();
    if chars.is_empty() {
        return Ok(windows);
    }

    let mut start = 0;
    loop {
        let hard_end = (start + config.max_chars).min(chars.len());
        if hard_end == chars.len() {
            windows.push(chars[start..].iter().collect());
            break;
        }

        let min_end = (start + config.max_chars / 2).max(start + config.overlap_chars + 1);
        let end = preferred_break(&chars, min_end, hard_end).unwrap_or(hard_end);
        windows.push(chars[start..end].iter().collect());
        start = end - config.overlap_chars;
    }

    Ok(windows)
}

fn preferred_break(chars: &[char], min_end: usize, max_end: usize) -> Option<usize> {
    SEPARATORS.iter().find_map(|separator| {
        let pattern: Vec<char> = separator.chars().collect();
        (min_end..=max_end)
            .rev()
            .find(|&end| end >= pattern.len() && chars[end - pattern.len()..end] == pattern[..])
    })
}

/// Chunks a single document. Whitespace-only documents are rejected so the
/// caller can report them per file instead of indexing nothing silently.
pub fn build_chunks(
    document: &SourceDocument,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>> {
    if document.raw_text.trim().is_empty() {
        return Err(IngestError::EmptyDocument(document.source_name.clone()));
    }

    let chunks = split_text(&document.raw_text, config)?
        .into_iter()
        .enumerate()
        .map(|(position, text)| Chunk {
            chunk_id: make_chunk_id(&document.source_name, position, &text),
            source: document.source_name.clone(),
            position: Some(position),
            text,
        })
        .collect();

    Ok(chunks)
}

fn make_chunk_id(source: &str, position: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update((position as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
