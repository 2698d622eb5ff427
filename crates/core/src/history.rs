use crate::error::ProviderError;
use crate::models::{Role, Turn};
use crate::traits::GenerationProvider;
use std::sync::Arc;
use tracing::info;

pub const SUMMARY_PREFIX: &str = "Summary of earlier conversation:\n";

/// Renders turns as `Role: text` lines.
pub fn format_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The last `count` turns of `history`.
pub fn recent_turns(history: &[Turn], count: usize) -> &[Turn] {
    &history[history.len().saturating_sub(count)..]
}

pub fn last_assistant_turn(history: &[Turn]) -> Option<&Turn> {
    history.iter().rev().find(|turn| turn.role == Role::Assistant)
}

/// Folds long histories into a single summary turn plus the most recent turns.
#[derive(Clone)]
pub struct HistoryCompactor {
    generator: Arc<dyn GenerationProvider>,
    threshold: usize,
    keep_recent: usize,
}

impl HistoryCompactor {
    pub fn new(
        generator: Arc<dyn GenerationProvider>,
        threshold: usize,
        keep_recent: usize,
    ) -> Self {
        Self {
            generator,
            threshold,
            keep_recent,
        }
    }

    pub fn needs_compaction(&self, history: &[Turn]) -> bool {
        history.len() > self.threshold
    }

    /// Replaces `history` with a summary of every turn followed by the
    /// `keep_recent` newest turns. History is left untouched on error.
    pub async fn compact(&self, history: &mut Vec<Turn>) -> Result<bool, ProviderError> {
        if !self.needs_compaction(history) {
            return Ok(false);
        }

        let prompt = format!(
            "Summarize the following conversation between a user and a document assistant. \
             Keep every fact, question and answer needed to continue the conversation.\n\n{}\n\nSummary:",
            format_transcript(history)
        );
        let summary = self.generator.generate(&prompt).await?;

        let before = history.len();
        let kept = recent_turns(history, self.keep_recent).to_vec();
        history.clear();
        history.push(Turn::assistant(format!("{SUMMARY_PREFIX}{}", summary.trim())));
        history.extend(kept);

        info!(before, after = history.len(), "compacted conversation history");
        Ok(true)
    }
}
