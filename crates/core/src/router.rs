//! Per-message routing between small talk, conversation recall, document
//! answers and the upload fallback.

use crate::classifier::IntentClassifier;
use crate::engine::{AnswerEvent, AnswerStream, RetrievalEngine};
use crate::error::ProviderError;
use crate::history::{last_assistant_turn, HistoryCompactor};
use crate::models::{ChatOptions, Classification, Evidence, Intent, Route};
use crate::session::Session;
use crate::traits::GenerationProvider;
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

pub const GREETING_REPLY: &str = "Hi 👋 I'm ready! Ask me anything about your uploaded documents.";
pub const META_PREFIX: &str = "Here is my previous response:\n\n";
pub const NO_PREVIOUS_RESPONSE: &str = "I haven't given a previous response yet.";
pub const FALLBACK_REPLY: &str =
    "Please upload documents and confirm the upload before asking questions.";
pub const FAILURE_REPLY: &str = "Sorry, I could not get an answer right now. Please try again.";

const GREETINGS: [&str; 5] = ["hi", "hello", "hey", "thanks", "thank you"];

static META_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(previous|last|prior|earlier)\s+(response|answer|reply|message)\b",
        r"(?i)\bwhat\s+did\s+you\s+(just\s+)?say\b",
        r"(?i)\brepeat\s+(that|yourself|your\s+(last\s+)?(response|answer|reply))\b",
        r"(?i)\bsay\s+that\s+again\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("meta pattern is valid"))
    .collect()
});

pub fn is_greeting(utterance: &str) -> bool {
    let normalized = utterance
        .trim()
        .trim_end_matches(['!', '.', '?', ','])
        .trim()
        .to_lowercase();
    GREETINGS.contains(&normalized.as_str())
}

pub fn references_previous_response(utterance: &str) -> bool {
    META_PATTERNS.iter().any(|pattern| pattern.is_match(utterance))
}

/// The routing decision, in priority order. Pure: the same utterance,
/// classification and binding state always give the same route.
pub fn decide_route(
    utterance: &str,
    classification: &Classification,
    has_engine: bool,
    threshold: f32,
) -> Route {
    if is_greeting(utterance) || classification.is_confident(Intent::SmallTalk, threshold) {
        Route::SmallTalk
    } else if references_previous_response(utterance)
        || classification.is_confident(Intent::ConversationMeta, threshold)
    {
        Route::ConversationMeta
    } else if has_engine {
        Route::DocumentAnswer
    } else {
        Route::Fallback
    }
}

pub fn recall_previous_response(session: &Session) -> String {
    match last_assistant_turn(session.history()) {
        Some(turn) => format!("{META_PREFIX}{}", turn.text),
        None => NO_PREVIOUS_RESPONSE.to_string(),
    }
}

pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    operation: &str,
    future: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| ProviderError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        })?
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub route: Route,
    pub reply: String,
    pub evidence: Vec<Evidence>,
    pub classification: Option<Classification>,
}

pub struct TurnRouter {
    classifier: IntentClassifier,
    generator: Arc<dyn GenerationProvider>,
    compactor: HistoryCompactor,
    options: ChatOptions,
}

impl TurnRouter {
    pub fn new(generator: Arc<dyn GenerationProvider>, options: ChatOptions) -> Self {
        Self {
            classifier: IntentClassifier::new(generator.clone()),
            compactor: HistoryCompactor::new(
                generator.clone(),
                options.compaction_threshold,
                options.compaction_keep_recent,
            ),
            generator,
            options,
        }
    }

    /// Greetings take the first branch whatever the model says, so they are
    /// the only utterances that skip the classifier.
    async fn classify(&self, utterance: &str) -> Option<Classification> {
        if is_greeting(utterance) {
            return None;
        }
        let classification = tokio::time::timeout(
            self.options.provider_timeout,
            self.classifier.classify(utterance),
        )
        .await
        .unwrap_or_else(|_| {
            warn!("classifier timed out; treating intent as unknown");
            Classification::unknown()
        });
        Some(classification)
    }

    async fn small_talk_reply(&self, utterance: &str) -> String {
        if is_greeting(utterance) || !self.options.conversational_small_talk {
            return GREETING_REPLY.to_string();
        }

        let prompt = format!(
            "You are a friendly assistant that answers questions about documents the user uploads. \
             Reply briefly and naturally to this message, without inventing document content:\n\n{utterance}"
        );
        match with_timeout(
            self.options.provider_timeout,
            "small talk",
            self.generator.generate(&prompt),
        )
        .await
        {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => GREETING_REPLY.to_string(),
            Err(error) => {
                warn!(%error, "small talk generation failed; using canned greeting");
                GREETING_REPLY.to_string()
            }
        }
    }

    async fn route(
        &self,
        session: &Session,
        engine: Option<&Arc<RetrievalEngine>>,
        utterance: &str,
    ) -> (Route, Option<Classification>) {
        let classification = self.classify(utterance).await;
        let route = decide_route(
            utterance,
            &classification.unwrap_or_else(Classification::unknown),
            engine.is_some(),
            self.options.intent_confidence_threshold,
        );
        info!(
            session = %session.id(),
            route = ?route,
            intent = classification.map(|c| c.intent.label()),
            "routing turn"
        );
        (route, classification)
    }

    /// Answers one message and records exactly one user and one assistant
    /// turn on `session`, whichever branch fires.
    pub async fn handle(
        &self,
        session: &mut Session,
        engine: Option<Arc<RetrievalEngine>>,
        utterance: &str,
    ) -> TurnOutcome {
        let (mut route, classification) = self.route(session, engine.as_ref(), utterance).await;
        let mut evidence = Vec::new();

        let reply = match (route, engine) {
            (Route::SmallTalk, _) => self.small_talk_reply(utterance).await,
            (Route::ConversationMeta, _) => recall_previous_response(session),
            (Route::DocumentAnswer, Some(engine)) => {
                match with_timeout(
                    self.options.provider_timeout,
                    "document answer",
                    engine.answer(utterance, session.history()),
                )
                .await
                {
                    Ok(answer) => {
                        evidence = answer.evidence;
                        answer.text
                    }
                    Err(error) => {
                        warn!(%error, "document answer failed");
                        route = Route::Failure;
                        FAILURE_REPLY.to_string()
                    }
                }
            }
            _ => {
                route = Route::Fallback;
                FALLBACK_REPLY.to_string()
            }
        };

        session.record_exchange(utterance, &reply);
        self.compact(session).await;

        TurnOutcome {
            route,
            reply,
            evidence,
            classification,
        }
    }

    /// Streaming counterpart of [`handle`](Self::handle). The session lock is
    /// held by the returned turn until it reaches a terminal event.
    pub async fn handle_streaming(
        &self,
        session: OwnedMutexGuard<Session>,
        engine: Option<Arc<RetrievalEngine>>,
        utterance: &str,
    ) -> StreamingTurn {
        let (route, classification) = self.route(&session, engine.as_ref(), utterance).await;

        let pending = match (route, engine) {
            (Route::SmallTalk, _) => Pending::Reply {
                route,
                text: self.small_talk_reply(utterance).await,
                delivered: false,
            },
            (Route::ConversationMeta, _) => Pending::Reply {
                route,
                text: recall_previous_response(&session),
                delivered: false,
            },
            (Route::DocumentAnswer, Some(engine)) => {
                match with_timeout(
                    self.options.provider_timeout,
                    "document answer",
                    engine.answer_stream(utterance, session.history()),
                )
                .await
                {
                    Ok(stream) => Pending::Answer(stream),
                    Err(error) => {
                        warn!(%error, "document answer failed to start");
                        Pending::Reply {
                            route: Route::Failure,
                            text: FAILURE_REPLY.to_string(),
                            delivered: false,
                        }
                    }
                }
            }
            _ => Pending::Reply {
                route: Route::Fallback,
                text: FALLBACK_REPLY.to_string(),
                delivered: false,
            },
        };

        StreamingTurn {
            session: Some(session),
            utterance: utterance.to_string(),
            classification,
            pending,
            compactor: self.compactor.clone(),
            timeout: self.options.provider_timeout,
        }
    }

    async fn compact(&self, session: &mut Session) {
        compact_history(&self.compactor, self.options.provider_timeout, session).await;
    }
}

async fn compact_history(compactor: &HistoryCompactor, limit: Duration, session: &mut Session) {
    if !compactor.needs_compaction(session.history()) {
        return;
    }
    let session_id = session.id();
    let compaction = compactor.compact(session.history_mut());
    if let Err(error) = with_timeout(limit, "history compaction", compaction).await {
        warn!(%error, session = %session_id, "history compaction skipped");
    }
}

#[derive(Debug)]
pub enum TurnEvent {
    Fragment(String),
    Completed(TurnOutcome),
    /// A provider failure; the failure reply has been recorded.
    Failed(TurnOutcome),
    /// Stopped by the caller; nothing was recorded.
    Cancelled,
}

enum Pending {
    /// A reply known up front, delivered as a single fragment.
    Reply {
        route: Route,
        text: String,
        delivered: bool,
    },
    Answer(AnswerStream),
    Cancelled,
    Done,
}

/// A turn whose reply is delivered incrementally. Dropping it before the
/// terminal event behaves like [`cancel`](Self::cancel).
pub struct StreamingTurn {
    session: Option<OwnedMutexGuard<Session>>,
    utterance: String,
    classification: Option<Classification>,
    pending: Pending,
    compactor: HistoryCompactor,
    timeout: Duration,
}

impl StreamingTurn {
    pub async fn next(&mut self) -> Option<TurnEvent> {
        match &mut self.pending {
            Pending::Done => None,
            Pending::Cancelled => {
                self.pending = Pending::Done;
                self.session = None;
                Some(TurnEvent::Cancelled)
            }
            Pending::Reply {
                route,
                text,
                delivered,
            } => {
                if !*delivered {
                    *delivered = true;
                    return Some(TurnEvent::Fragment(text.clone()));
                }

                let outcome = TurnOutcome {
                    route: *route,
                    reply: std::mem::take(text),
                    evidence: Vec::new(),
                    classification: self.classification,
                };
                self.finish(&outcome).await;
                if outcome.route == Route::Failure {
                    Some(TurnEvent::Failed(outcome))
                } else {
                    Some(TurnEvent::Completed(outcome))
                }
            }
            Pending::Answer(stream) => {
                let event = match tokio::time::timeout(self.timeout, stream.next()).await {
                    Ok(event) => event,
                    Err(_) => {
                        stream.cancel();
                        Some(AnswerEvent::Failed(ProviderError::Timeout {
                            operation: "document answer stream".to_string(),
                            seconds: self.timeout.as_secs(),
                        }))
                    }
                };

                match event {
                    Some(AnswerEvent::Fragment(fragment)) => Some(TurnEvent::Fragment(fragment)),
                    Some(AnswerEvent::Completed(answer)) => {
                        let outcome = TurnOutcome {
                            route: Route::DocumentAnswer,
                            reply: answer.text,
                            evidence: answer.evidence,
                            classification: self.classification,
                        };
                        self.finish(&outcome).await;
                        Some(TurnEvent::Completed(outcome))
                    }
                    Some(AnswerEvent::Failed(error)) => {
                        warn!(%error, "document answer stream failed");
                        let outcome = TurnOutcome {
                            route: Route::Failure,
                            reply: FAILURE_REPLY.to_string(),
                            evidence: Vec::new(),
                            classification: self.classification,
                        };
                        self.finish(&outcome).await;
                        Some(TurnEvent::Failed(outcome))
                    }
                    Some(AnswerEvent::Cancelled) | None => {
                        self.pending = Pending::Done;
                        self.session = None;
                        Some(TurnEvent::Cancelled)
                    }
                }
            }
        }
    }

    /// Stops the turn. Nothing is recorded on the session.
    pub fn cancel(&mut self) {
        match &mut self.pending {
            Pending::Answer(stream) => {
                stream.cancel();
                self.pending = Pending::Cancelled;
            }
            Pending::Reply { .. } => self.pending = Pending::Cancelled,
            Pending::Cancelled | Pending::Done => {}
        }
    }

    async fn finish(&mut self, outcome: &TurnOutcome) {
        self.pending = Pending::Done;
        if let Some(mut session) = self.session.take() {
            session.record_exchange(&self.utterance, &outcome.reply);
            compact_history(&self.compactor, self.timeout, &mut session).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::index::build_index;
    use crate::models::Role;
    use crate::session::SessionRegistry;
    use crate::stores::InMemoryIndex;
    use crate::Chunk;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers each kind of prompt the router sends with a fixed reply.
    struct FakeModel {
        classification: String,
        answer: Result<String, ()>,
        classifier_calls: AtomicUsize,
    }

    impl FakeModel {
        fn new(classification: &str) -> Self {
            Self {
                classification: classification.to_string(),
                answer: Ok("Pumps must be inspected monthly.".to_string()),
                classifier_calls: AtomicUsize::new(0),
            }
        }

        fn failing_answers(mut self) -> Self {
            self.answer = Err(());
            self
        }
    }

    #[async_trait]
    impl GenerationProvider for FakeModel {
        async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
            if prompt.starts_with("You classify a single chat message") {
                self.classifier_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(self.classification.clone());
            }
            if prompt.starts_with("Summarize the following conversation") {
                return Ok("earlier talk".to_string());
            }
            if prompt.starts_with("You are a friendly assistant") {
                return Ok("Doing well, thanks for asking!".to_string());
            }
            self.answer
                .clone()
                .map_err(|_| ProviderError::Request("model offline".to_string()))
        }
    }

    fn document_question() -> &'static str {
        r#"{"intent": "document_question", "confidence": 0.9}"#
    }

    async fn engine(model: Arc<FakeModel>) -> Arc<RetrievalEngine> {
        let embedder = CharacterNgramEmbedder::default();
        let chunks = vec![Chunk {
            chunk_id: "manual-0".to_string(),
            source: "manual.docx".to_string(),
            position: Some(0),
            text: "Pumps must be inspected every month by the on-site engineer.".to_string(),
        }];
        let index = build_index(InMemoryIndex::new(embedder.dimensions), chunks, &embedder)
            .await
            .unwrap();
        Arc::new(RetrievalEngine::new(
            index,
            Arc::new(embedder),
            model,
            &ChatOptions::default(),
        ))
    }

    fn classified(intent: Intent, confidence: f32) -> Classification {
        Classification { intent, confidence }
    }

    #[test]
    fn greetings_are_recognised_after_normalisation() {
        for utterance in ["hi", "Hello!", "  hey ", "Thanks.", "thank you!"] {
            assert!(is_greeting(utterance), "{utterance}");
        }
        assert!(!is_greeting("hi, what does section 2 say?"));
        assert!(!is_greeting("history"));
    }

    #[test]
    fn previous_response_phrases_are_detected() {
        assert!(references_previous_response("what was your last response?"));
        assert!(references_previous_response("Can you repeat that"));
        assert!(references_previous_response("what did you just say"));
        assert!(!references_previous_response("what is the last step of the procedure?"));
    }

    #[test]
    fn route_priority_is_small_talk_then_meta_then_documents() {
        let unknown = Classification::unknown();
        assert_eq!(decide_route("hello", &unknown, true, 0.6), Route::SmallTalk);
        assert_eq!(
            decide_route("what was your last answer", &unknown, true, 0.6),
            Route::ConversationMeta
        );
        assert_eq!(
            decide_route("anything", &classified(Intent::SmallTalk, 0.8), true, 0.6),
            Route::SmallTalk
        );
        assert_eq!(
            decide_route("anything", &classified(Intent::ConversationMeta, 0.6), false, 0.6),
            Route::ConversationMeta
        );
        assert_eq!(
            decide_route("anything", &classified(Intent::SmallTalk, 0.59), true, 0.6),
            Route::DocumentAnswer
        );
        assert_eq!(decide_route("anything", &unknown, false, 0.6), Route::Fallback);
    }

    #[test]
    fn route_decision_is_deterministic() {
        let classification = classified(Intent::DocumentQuestion, 0.7);
        let first = decide_route("what is the warranty?", &classification, true, 0.6);
        for _ in 0..10 {
            assert_eq!(
                decide_route("what is the warranty?", &classification, true, 0.6),
                first
            );
        }
    }

    #[tokio::test]
    async fn meta_question_replays_last_assistant_turn() {
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;
        session.record_exchange("hi", "Hello!");

        let model = Arc::new(FakeModel::new(document_question()));
        let router = TurnRouter::new(model.clone(), ChatOptions::default());
        let outcome = router
            .handle(&mut session, None, "what was your last response?")
            .await;

        assert_eq!(outcome.route, Route::ConversationMeta);
        assert_eq!(outcome.reply, format!("{META_PREFIX}Hello!"));
        assert_eq!(model.classifier_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn greetings_skip_the_classifier() {
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;
        let model = Arc::new(FakeModel::new(document_question()));
        let router = TurnRouter::new(model.clone(), ChatOptions::default());

        let outcome = router.handle(&mut session, None, "Hello!").await;
        assert_eq!(outcome.route, Route::SmallTalk);
        assert_eq!(outcome.classification, None);
        assert_eq!(model.classifier_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn confident_small_talk_outranks_a_meta_phrase() {
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;
        let model = Arc::new(FakeModel::new(r#"{"intent":"small_talk","confidence":0.9}"#));
        let router = TurnRouter::new(model.clone(), ChatOptions::default());

        let utterance = "haha nice, loved your last answer, how is your day going?";
        assert!(references_previous_response(utterance));

        let outcome = router.handle(&mut session, None, utterance).await;
        let classification = classified(Intent::SmallTalk, 0.9);
        assert_eq!(outcome.classification, Some(classification));
        assert_eq!(
            outcome.route,
            decide_route(utterance, &classification, false, 0.6)
        );
        assert_eq!(outcome.route, Route::SmallTalk);
        assert_eq!(outcome.reply, "Doing well, thanks for asking!");
        assert_eq!(model.classifier_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn meta_question_without_history_says_so() {
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;
        let router = TurnRouter::new(
            Arc::new(FakeModel::new(document_question())),
            ChatOptions::default(),
        );

        let outcome = router.handle(&mut session, None, "repeat your last answer").await;
        assert_eq!(outcome.reply, NO_PREVIOUS_RESPONSE);
    }

    #[tokio::test]
    async fn every_branch_records_exactly_one_exchange() {
        let model = Arc::new(FakeModel::new(document_question()));
        let engine = engine(model.clone()).await;
        let router = TurnRouter::new(model, ChatOptions::default());
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;

        let turns: [(&str, Option<Arc<RetrievalEngine>>, Route); 4] = [
            ("hello", None, Route::SmallTalk),
            ("say that again", None, Route::ConversationMeta),
            ("how often are pumps inspected?", None, Route::Fallback),
            ("how often are pumps inspected?", Some(engine), Route::DocumentAnswer),
        ];
        for (index, (utterance, engine, route)) in turns.into_iter().enumerate() {
            let outcome = router.handle(&mut session, engine, utterance).await;
            assert_eq!(outcome.route, route);
            let history = session.history();
            assert_eq!(history.len(), 2 * (index + 1));
            assert_eq!(history[history.len() - 2].role, Role::User);
            assert_eq!(history[history.len() - 2].text, utterance);
            assert_eq!(history[history.len() - 1].role, Role::Assistant);
            assert_eq!(history[history.len() - 1].text, outcome.reply);
        }
    }

    #[tokio::test]
    async fn document_answers_carry_evidence() {
        let model = Arc::new(FakeModel::new(document_question()));
        let engine = engine(model.clone()).await;
        let router = TurnRouter::new(model, ChatOptions::default());
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;

        let outcome = router
            .handle(&mut session, Some(engine), "how often are pumps inspected?")
            .await;
        assert_eq!(outcome.route, Route::DocumentAnswer);
        assert!(outcome.reply.starts_with("Pumps must be inspected monthly."));
        assert!(outcome.reply.contains("manual.docx"));
        assert_eq!(outcome.evidence.len(), 1);
        assert_eq!(
            outcome.classification,
            Some(classified(Intent::DocumentQuestion, 0.9))
        );
    }

    #[tokio::test]
    async fn provider_failure_records_failure_turn() {
        let model = Arc::new(FakeModel::new(document_question()).failing_answers());
        let engine = engine(model.clone()).await;
        let router = TurnRouter::new(model, ChatOptions::default());
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;

        let outcome = router
            .handle(&mut session, Some(engine), "how often are pumps inspected?")
            .await;
        assert_eq!(outcome.route, Route::Failure);
        assert_eq!(outcome.reply, FAILURE_REPLY);
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].text, FAILURE_REPLY);
    }

    #[tokio::test]
    async fn unparseable_classification_falls_through_to_documents() {
        let model = Arc::new(FakeModel::new("I think it is small talk"));
        let engine = engine(model.clone()).await;
        let router = TurnRouter::new(model, ChatOptions::default());
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;

        let outcome = router
            .handle(&mut session, Some(engine), "how are you doing today")
            .await;
        assert_eq!(outcome.classification, Some(Classification::unknown()));
        assert_eq!(outcome.route, Route::DocumentAnswer);
    }

    #[tokio::test]
    async fn confident_small_talk_uses_the_model() {
        let model = Arc::new(FakeModel::new(r#"{"intent":"small_talk","confidence":0.95}"#));
        let router = TurnRouter::new(model, ChatOptions::default());
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;

        let outcome = router.handle(&mut session, None, "how are you doing today").await;
        assert_eq!(outcome.route, Route::SmallTalk);
        assert_eq!(outcome.reply, "Doing well, thanks for asking!");

        let greeting = router.handle(&mut session, None, "hello").await;
        assert_eq!(greeting.reply, GREETING_REPLY);
    }

    #[tokio::test]
    async fn long_histories_are_compacted_after_the_turn() {
        let options = ChatOptions {
            compaction_threshold: 4,
            compaction_keep_recent: 2,
            ..ChatOptions::default()
        };
        let router = TurnRouter::new(Arc::new(FakeModel::new(document_question())), options);
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();
        let mut session = handle.lock().await;

        for _ in 0..3 {
            router.handle(&mut session, None, "hi").await;
        }
        let history = session.history();
        assert_eq!(history.len(), 3);
        assert!(history[0].text.starts_with(crate::history::SUMMARY_PREFIX));
    }

    #[tokio::test]
    async fn streamed_document_answer_is_recorded_on_completion() {
        let model = Arc::new(FakeModel::new(document_question()));
        let engine = engine(model.clone()).await;
        let router = TurnRouter::new(model, ChatOptions::default());
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();

        let mut turn = router
            .handle_streaming(
                handle.clone().lock_owned().await,
                Some(engine),
                "how often are pumps inspected?",
            )
            .await;

        let mut fragments = String::new();
        let outcome = loop {
            match turn.next().await {
                Some(TurnEvent::Fragment(fragment)) => fragments.push_str(&fragment),
                Some(TurnEvent::Completed(outcome)) => break outcome,
                other => panic!("unexpected event: {other:?}"),
            }
        };
        assert!(turn.next().await.is_none());
        assert_eq!(fragments, "Pumps must be inspected monthly.");
        assert_eq!(outcome.route, Route::DocumentAnswer);

        let session = handle.lock().await;
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].text, outcome.reply);
    }

    #[tokio::test]
    async fn cancelled_stream_records_nothing_and_releases_the_session() {
        let router = TurnRouter::new(
            Arc::new(FakeModel::new(document_question())),
            ChatOptions::default(),
        );
        let registry = SessionRegistry::new();
        let (_, handle) = registry.active_session();

        let mut turn = router
            .handle_streaming(handle.clone().lock_owned().await, None, "hello")
            .await;
        assert!(matches!(turn.next().await, Some(TurnEvent::Fragment(_))));
        turn.cancel();
        assert!(matches!(turn.next().await, Some(TurnEvent::Cancelled)));
        assert!(turn.next().await.is_none());

        assert!(handle.try_lock().unwrap().history().is_empty());
    }
}
