use crate::embeddings::join_endpoint;
use crate::error::ProviderError;
use crate::traits::{FragmentStream, GenerationProvider};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.25;

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiGenerator {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    stream: bool,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: join_endpoint(base_url, "chat/completions")?,
            api_key: api_key.into(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<Response, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            stream,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.api_key.trim())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ProviderError::BackendResponse {
                backend: "openai-chat".to_string(),
                details: format!("{status}: {text}"),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let parsed: ChatResponse = self.send(prompt, false).await?.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default())
    }

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError> {
        let response = self.send(prompt, true).await?;
        let bytes = response
            .bytes_stream()
            .map(|item| item.map(|bytes| bytes.to_vec()).map_err(ProviderError::from))
            .boxed();
        Ok(sse_fragments(bytes))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> Result<SseLine, ProviderError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseLine::Ignore);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(data)?;
    let text = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect::<String>();

    if text.is_empty() {
        Ok(SseLine::Ignore)
    } else {
        Ok(SseLine::Fragment(text))
    }
}

struct SseState {
    bytes: BoxStream<'static, Result<Vec<u8>, ProviderError>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

impl SseState {
    fn drain_lines(&mut self) {
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if self.finished {
                continue;
            }
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                Ok(SseLine::Fragment(text)) => self.pending.push_back(Ok(text)),
                Ok(SseLine::Done) => self.finished = true,
                Ok(SseLine::Ignore) => {}
                Err(error) => {
                    self.pending.push_back(Err(error));
                    self.finished = true;
                }
            }
        }
    }
}

/// Decodes a server-sent-event byte stream into content fragments.
fn sse_fragments(bytes: BoxStream<'static, Result<Vec<u8>, ProviderError>>) -> FragmentStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((fragment, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.drain_lines();
                }
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.buffer.push(b'\n');
                    state.drain_lines();
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
