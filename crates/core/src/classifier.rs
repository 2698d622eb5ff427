use crate::error::{ClassificationParseError, ClassifyError};
use crate::models::{Classification, Intent};
use crate::traits::GenerationProvider;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const CLASSIFIER_INSTRUCTIONS: &str = "\
You classify a single chat message sent to a document question-answering assistant.

Allowed intents:
- small_talk: greetings, thanks, pleasantries or chit-chat.
- conversation_meta: questions about the conversation itself, such as asking what the assistant said before.
- document_question: a question or request that should be answered from the uploaded documents.
- unknown: anything else.

Respond with exactly one JSON object and nothing else, in the form
{\"intent\": \"<one of the allowed intents>\", \"confidence\": <number between 0 and 1>}";

pub fn classification_prompt(utterance: &str) -> String {
    format!("{CLASSIFIER_INSTRUCTIONS}\n\nMessage:\n{utterance}\n\nJSON:")
}

/// Labels an utterance with one of the fixed intents using a generation model.
#[derive(Clone)]
pub struct IntentClassifier {
    generator: Arc<dyn GenerationProvider>,
}

impl IntentClassifier {
    pub fn new(generator: Arc<dyn GenerationProvider>) -> Self {
        Self { generator }
    }

    pub async fn try_classify(&self, utterance: &str) -> Result<Classification, ClassifyError> {
        let raw = self
            .generator
            .generate(&classification_prompt(utterance))
            .await?;
        Ok(parse_classification(&raw)?)
    }

    /// Classifies `utterance`, degrading to `(unknown, 0.0)` when the model
    /// output cannot be parsed or the model cannot be reached.
    pub async fn classify(&self, utterance: &str) -> Classification {
        match self.try_classify(utterance).await {
            Ok(classification) => {
                debug!(
                    intent = classification.intent.label(),
                    confidence = classification.confidence,
                    "classified utterance"
                );
                classification
            }
            Err(ClassifyError::Parse(error)) => {
                warn!(%error, "classifier output rejected; treating intent as unknown");
                Classification::unknown()
            }
            Err(ClassifyError::Provider(error)) => {
                warn!(%error, "classifier unavailable; treating intent as unknown");
                Classification::unknown()
            }
        }
    }
}

pub fn parse_classification(raw: &str) -> Result<Classification, ClassificationParseError> {
    let body = strip_code_fence(raw.trim());
    let value: Value = serde_json::from_str(body)
        .map_err(|error| ClassificationParseError::MalformedJson(error.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ClassificationParseError::MalformedJson(body.to_string()))?;

    let intent = match object.get("intent") {
        None | Some(Value::Null) => return Err(ClassificationParseError::MissingKey("intent")),
        Some(Value::String(label)) => Intent::from_label(label)
            .ok_or_else(|| ClassificationParseError::UnknownIntent(label.clone()))?,
        Some(other) => return Err(ClassificationParseError::UnknownIntent(other.to_string())),
    };

    let confidence = match object.get("confidence") {
        None | Some(Value::Null) => return Err(ClassificationParseError::MissingKey("confidence")),
        Some(value) => value
            .as_f64()
            .filter(|number| (0.0..=1.0).contains(number))
            .ok_or_else(|| ClassificationParseError::InvalidConfidence(value.to_string()))?,
    };

    Ok(Classification {
        intent,
        confidence: confidence as f32,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
