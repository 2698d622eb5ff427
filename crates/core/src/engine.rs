//! Retrieval-augmented answering over one bound [`DocumentIndex`].

use crate::embeddings::Embedder;
use crate::error::ProviderError;
use crate::history::{format_transcript, recent_turns};
use crate::index::DocumentIndex;
use crate::models::{Answer, ChatOptions, Evidence, ScoredChunk, Turn};
use crate::traits::{FragmentStream, GenerationProvider};
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

const ANSWER_INSTRUCTIONS: &str = "\
You are a helpful documentation assistant.

Rules:
- Speak naturally and clearly.
- Answer ONLY from the provided documents.
- If information is missing, say so.
- Use the conversation so far to resolve references such as \"it\" or \"as you said before\".";

const SNIPPET_CHARS: usize = 160;

pub const NO_ANSWER: &str = "I couldn't find an answer to that in the uploaded documents.";
pub const SOURCES_UNAVAILABLE: &str = "_Sources unavailable: no matching passages were found._";

#[derive(Clone)]
pub struct RetrievalEngine {
    index: DocumentIndex,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn GenerationProvider>,
    top_k: usize,
    history_turns: usize,
}

impl RetrievalEngine {
    pub fn new(
        index: DocumentIndex,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn GenerationProvider>,
        options: &ChatOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            top_k: options.top_k,
            history_turns: options.history_turns_in_prompt,
        }
    }

    pub fn index(&self) -> &DocumentIndex {
        &self.index
    }

    pub async fn retrieve(&self, question: &str) -> Result<Vec<ScoredChunk>, ProviderError> {
        let vector = self.embedder.embed(question).await?;
        let hits = self.index.query(&vector, self.top_k).await?;
        debug!(hit_count = hits.len(), "retrieved context chunks");
        Ok(hits)
    }

    pub fn prompt(&self, question: &str, hits: &[ScoredChunk], history: &[Turn]) -> String {
        build_prompt(question, hits, recent_turns(history, self.history_turns))
    }

    pub async fn answer(&self, question: &str, history: &[Turn]) -> Result<Answer, ProviderError> {
        let hits = self.retrieve(question).await?;
        let generated = self
            .generator
            .generate(&self.prompt(question, &hits, history))
            .await?;
        Ok(assemble_answer(&generated, &hits))
    }

    /// Like [`answer`](Self::answer) but yields the generated text as it arrives.
    pub async fn answer_stream(
        &self,
        question: &str,
        history: &[Turn],
    ) -> Result<AnswerStream, ProviderError> {
        let hits = self.retrieve(question).await?;
        let fragments = self
            .generator
            .generate_stream(&self.prompt(question, &hits, history))
            .await?;
        Ok(AnswerStream::new(fragments, hits))
    }
}

pub fn build_prompt(question: &str, hits: &[ScoredChunk], history: &[Turn]) -> String {
    let context = hits
        .iter()
        .map(|hit| hit.chunk.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = String::from(ANSWER_INSTRUCTIONS);
    if !history.is_empty() {
        prompt.push_str("\n\nConversation so far:\n");
        prompt.push_str(&format_transcript(history));
    }
    prompt.push_str("\n\nContext:\n");
    prompt.push_str(&context);
    prompt.push_str("\n\nQuestion:\n");
    prompt.push_str(question);
    prompt.push_str("\n\nAnswer:\n");
    prompt
}

/// One evidence entry per distinct `(source, locator)`, in rank order.
pub fn collect_evidence(hits: &[ScoredChunk]) -> Vec<Evidence> {
    let mut evidence: Vec<Evidence> = Vec::new();
    for hit in hits {
        let locator = hit.chunk.locator();
        if evidence
            .iter()
            .any(|seen| seen.source == hit.chunk.source && seen.locator == locator)
        {
            continue;
        }
        evidence.push(Evidence {
            source: hit.chunk.source.clone(),
            locator,
            snippet: snippet(&hit.chunk.text),
        });
    }
    evidence
}

pub fn format_sources(evidence: &[Evidence]) -> String {
    if evidence.is_empty() {
        return SOURCES_UNAVAILABLE.to_string();
    }
    let lines = evidence
        .iter()
        .map(|item| format!("- {} ({})", item.source, item.locator))
        .collect::<Vec<_>>()
        .join("\n");
    format!("**Sources:**\n{lines}")
}

pub fn assemble_answer(generated: &str, hits: &[ScoredChunk]) -> Answer {
    let evidence = collect_evidence(hits);
    let body = match generated.trim() {
        "" => NO_ANSWER,
        text => text,
    };
    Answer {
        text: format!("{body}\n\n{}", format_sources(&evidence)),
        evidence,
    }
}

fn snippet(text: &str) -> String {
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() <= SNIPPET_CHARS {
        return flattened;
    }
    let mut cut: String = flattened.chars().take(SNIPPET_CHARS).collect();
    cut.push('…');
    cut
}

#[derive(Debug)]
pub enum AnswerEvent {
    Fragment(String),
    Completed(Answer),
    Failed(ProviderError),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Streaming,
    CancelRequested,
    Finished,
}

/// Pull-based stream of answer fragments ending in exactly one terminal
/// event: `Completed`, `Failed` or `Cancelled`.
pub struct AnswerStream {
    fragments: Option<FragmentStream>,
    hits: Vec<ScoredChunk>,
    buffer: String,
    state: StreamState,
}

impl AnswerStream {
    pub fn new(fragments: FragmentStream, hits: Vec<ScoredChunk>) -> Self {
        Self {
            fragments: Some(fragments),
            hits,
            buffer: String::new(),
            state: StreamState::Streaming,
        }
    }

    pub async fn next(&mut self) -> Option<AnswerEvent> {
        match self.state {
            StreamState::Finished => return None,
            StreamState::CancelRequested => {
                self.state = StreamState::Finished;
                return Some(AnswerEvent::Cancelled);
            }
            StreamState::Streaming => {}
        }

        loop {
            let next = match self.fragments.as_mut() {
                Some(fragments) => fragments.next().await,
                None => return None,
            };
            match next {
                Some(Ok(fragment)) if fragment.is_empty() => continue,
                Some(Ok(fragment)) => {
                    self.buffer.push_str(&fragment);
                    return Some(AnswerEvent::Fragment(fragment));
                }
                Some(Err(error)) => {
                    self.finish();
                    return Some(AnswerEvent::Failed(error));
                }
                None => {
                    self.finish();
                    return Some(AnswerEvent::Completed(assemble_answer(
                        &self.buffer,
                        &self.hits,
                    )));
                }
            }
        }
    }

    /// Stops fragment delivery; the next call to `next` reports `Cancelled`.
    pub fn cancel(&mut self) {
        if self.state == StreamState::Streaming {
            self.fragments = None;
            self.state = StreamState::CancelRequested;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

    fn finish(&mut self) {
        self.fragments = None;
        self.state = StreamState::Finished;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::index::build_index;
    use crate::stores::InMemoryIndex;
    use crate::Chunk;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedGenerator {
        prompts: Mutex<Vec<String>>,
        reply: String,
    }

    #[async_trait]
    impl GenerationProvider for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }

        async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let words = self
                .reply
                .split_inclusive(' ')
                .map(|word| Ok(word.to_string()))
                .collect::<Vec<_>>();
            Ok(stream::iter(words).boxed())
        }
    }

    fn chunk(source: &str, position: usize, text: &str) -> Chunk {
        Chunk {
            chunk_id: format!("{source}-{position}"),
            source: source.to_string(),
            position: Some(position),
            text: text.to_string(),
        }
    }

    fn hit(source: &str, position: Option<usize>, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                chunk_id: format!("{source}-{position:?}"),
                source: source.to_string(),
                position,
                text: text.to_string(),
            },
            score: 0.5,
        }
    }

    async fn engine(chunks: Vec<Chunk>, reply: &str) -> (RetrievalEngine, Arc<ScriptedGenerator>) {
        let embedder = CharacterNgramEmbedder::default();
        let index = build_index(InMemoryIndex::new(embedder.dimensions), chunks, &embedder)
            .await
            .unwrap();
        let generator = Arc::new(ScriptedGenerator {
            reply: reply.to_string(),
            ..Default::default()
        });
        let engine = RetrievalEngine::new(
            index,
            Arc::new(embedder),
            generator.clone(),
            &ChatOptions::default(),
        );
        (engine, generator)
    }

    #[test]
    fn sources_are_deduplicated_in_rank_order() {
        let hits = vec![
            hit("b.docx", Some(1), "beta"),
            hit("a.docx", Some(0), "alpha"),
            hit("b.docx", Some(1), "beta again"),
            hit("c.docx", None, "gamma"),
        ];

        let answer = assemble_answer("Seals are replaced yearly.", &hits);
        assert_eq!(answer.evidence.len(), 3);
        assert_eq!(
            answer.text,
            "Seals are replaced yearly.\n\n**Sources:**\n\
             - b.docx (chunk 2)\n\
             - a.docx (chunk 1)\n\
             - c.docx (unknown location)"
        );
    }

    #[test]
    fn empty_retrieval_still_produces_an_answer() {
        let answer = assemble_answer("", &[]);
        assert!(answer.evidence.is_empty());
        assert!(answer.text.starts_with(NO_ANSWER));
        assert!(answer.text.ends_with(SOURCES_UNAVAILABLE));
    }

    #[test]
    fn long_snippets_are_truncated() {
        let evidence = collect_evidence(&[hit("a.docx", Some(0), &"word ".repeat(100))]);
        assert_eq!(evidence[0].snippet.chars().count(), SNIPPET_CHARS + 1);
    }

    #[test]
    fn prompt_includes_history_context_and_question() {
        let history = vec![
            Turn::user("what is the pump model?"),
            Turn::assistant("It is the P-200."),
        ];
        let hits = [hit("a.docx", Some(0), "P-200 service: yearly")];
        let prompt = build_prompt("how often is it serviced?", &hits, &history);
        assert!(prompt.contains("Answer ONLY from the provided documents."));
        assert!(prompt.contains("Assistant: It is the P-200."));
        assert!(prompt.contains("Context:\nP-200 service: yearly"));
        assert!(prompt.contains("Question:\nhow often is it serviced?"));
    }

    #[tokio::test]
    async fn answer_retrieves_top_k_and_attributes_sources() {
        let chunks = (0..6)
            .map(|position| {
                let text = format!("Section {position} covers seal replacement.");
                chunk("manual.docx", position, &text)
            })
            .collect();
        let (engine, generator) = engine(chunks, "Replace the seals yearly.").await;

        let answer = engine.answer("seal replacement", &[]).await.unwrap();
        assert_eq!(answer.evidence.len(), 4);
        assert!(answer.text.starts_with("Replace the seals yearly."));
        assert!(answer.text.contains("**Sources:**"));

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts[0].matches("covers seal replacement.").count(), 4);
    }

    #[tokio::test]
    async fn empty_index_answers_without_evidence() {
        let (engine, _) = engine(Vec::new(), "").await;
        let answer = engine.answer("anything?", &[]).await.unwrap();
        assert!(answer.evidence.is_empty());
        assert!(!answer.text.is_empty());
    }

    #[tokio::test]
    async fn streamed_answer_completes_with_full_text() {
        let (engine, _) =
            engine(vec![chunk("a.docx", 0, "pumps")], "Pumps are serviced yearly.").await;
        let mut stream = engine.answer_stream("pumps", &[]).await.unwrap();

        let mut fragments = String::new();
        let completed = loop {
            match stream.next().await {
                Some(AnswerEvent::Fragment(fragment)) => fragments.push_str(&fragment),
                Some(AnswerEvent::Completed(answer)) => break answer,
                other => panic!("unexpected event {other:?}"),
            }
        };

        assert_eq!(fragments, "Pumps are serviced yearly.");
        assert!(completed.text.starts_with("Pumps are serviced yearly.\n\n**Sources:**"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_stream_stops_delivering_fragments() {
        let (engine, _) = engine(vec![chunk("a.docx", 0, "pumps")], "one two three four").await;
        let mut stream = engine.answer_stream("pumps", &[]).await.unwrap();

        assert!(matches!(stream.next().await, Some(AnswerEvent::Fragment(_))));
        stream.cancel();
        assert!(matches!(stream.next().await, Some(AnswerEvent::Cancelled)));
        assert!(stream.next().await.is_none());
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn stream_errors_are_terminal() {
        let failing: FragmentStream = stream::iter(vec![
            Ok("partial ".to_string()),
            Err(ProviderError::Request("connection reset".to_string())),
        ])
        .boxed();
        let mut stream = AnswerStream::new(failing, Vec::new());

        assert!(matches!(stream.next().await, Some(AnswerEvent::Fragment(_))));
        assert!(matches!(stream.next().await, Some(AnswerEvent::Failed(_))));
        stream.cancel();
        assert!(stream.next().await.is_none());
    }
}
