use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Placeholder locator used when a chunk carries no positional metadata.
pub const UNKNOWN_LOCATOR: &str = "unknown location";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub source: String,
    /// Zero-based window number within `source`.
    pub position: Option<usize>,
    pub text: String,
}

impl Chunk {
    pub fn locator(&self) -> String {
        match self.position {
            Some(position) => format!("chunk {}", position + 1),
            None => UNKNOWN_LOCATOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("User"),
            Role::Assistant => f.write_str("Assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    SmallTalk,
    ConversationMeta,
    DocumentQuestion,
    Unknown,
}

impl Intent {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "small_talk" => Some(Intent::SmallTalk),
            "conversation_meta" => Some(Intent::ConversationMeta),
            "document_question" => Some(Intent::DocumentQuestion),
            "unknown" => Some(Intent::Unknown),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Intent::SmallTalk => "small_talk",
            Intent::ConversationMeta => "conversation_meta",
            Intent::DocumentQuestion => "document_question",
            Intent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f32,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            intent: Intent::Unknown,
            confidence: 0.0,
        }
    }

    pub fn is_confident(&self, intent: Intent, threshold: f32) -> bool {
        self.intent == intent && self.confidence >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub source: String,
    pub locator: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub evidence: Vec<Evidence>,
}

/// Which branch of the turn router produced a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    SmallTalk,
    ConversationMeta,
    DocumentAnswer,
    Fallback,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexScope {
    /// A new index is bound only to the session that uploaded it.
    #[default]
    PerSession,
    /// A new index replaces the registry-wide index seen by every session
    /// that has no index of its own.
    Shared,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    pub top_k: usize,
    pub intent_confidence_threshold: f32,
    pub compaction_threshold: usize,
    pub compaction_keep_recent: usize,
    pub history_turns_in_prompt: usize,
    pub provider_timeout: Duration,
    pub conversational_small_talk: bool,
    pub index_scope: IndexScope,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            chunk_max_chars: 800,
            chunk_overlap_chars: 150,
            top_k: 4,
            intent_confidence_threshold: 0.6,
            compaction_threshold: 20,
            compaction_keep_recent: 10,
            history_turns_in_prompt: 6,
            provider_timeout: Duration::from_secs(60),
            conversational_small_talk: true,
            index_scope: IndexScope::PerSession,
        }
    }
}
