//! OpenAI adapter: chat completions (single-shot and streamed), image generation and
//! audio transcription behind the core `CompletionClient` port.

mod sse;

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use gtb_core::{
    errors::Error,
    model::{
        client::{summary_messages, CompletionClient, SUMMARY_TEMPERATURE},
        types::{Completion, CompletionRequest, TokenUsage, Turn},
    },
    usage::ImageSize,
    Result,
};

pub use sse::{SseEvent, SseLineBuffer};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const TRANSCRIPTION_MODEL: &str = "whisper-1";

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    /// Whole-request bound for single-shot calls; per-chunk idle bound for streams.
    timeout: Duration,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout,
            http,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn chat(&self, body: &ChatRequest<'_>) -> Result<ChatResponse> {
        let resp = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| remote("chat request", e))?;
        let resp = ensure_success(resp, "chat completion").await?;
        resp.json::<ChatResponse>()
            .await
            .map_err(|e| remote("chat response", e))
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, req: CompletionRequest) -> Result<Completion> {
        let p = &req.params;
        let body = ChatRequest {
            model: &p.model,
            messages: &req.messages,
            max_tokens: Some(p.max_tokens),
            n: Some(p.n),
            temperature: p.temperature,
            presence_penalty: Some(p.presence_penalty),
            frequency_penalty: Some(p.frequency_penalty),
            stream: false,
        };
        let resp = self.chat(&body).await?;

        let choices: Vec<String> = resp
            .choices
            .into_iter()
            .filter_map(|c| c.message.content)
            .collect();
        if choices.iter().all(|c| c.trim().is_empty()) {
            return Err(Error::RemoteCallFailed(
                "chat completion returned no content".to_string(),
            ));
        }
        Ok(Completion {
            choices,
            usage: resp.usage,
        })
    }

    async fn complete_stream(
        &self,
        req: CompletionRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) -> Result<()> + Send),
    ) -> Result<String> {
        let p = &req.params;
        let body = ChatRequest {
            model: &p.model,
            messages: &req.messages,
            max_tokens: Some(p.max_tokens),
            n: Some(1),
            temperature: p.temperature,
            presence_penalty: Some(p.presence_penalty),
            frequency_penalty: Some(p.frequency_penalty),
            stream: true,
        };
        let resp = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| remote("chat stream request", e))?;
        let resp = ensure_success(resp, "chat stream").await?;

        let mut bytes = Box::pin(resp.bytes_stream());
        let mut lines = SseLineBuffer::new();
        let mut answer = String::new();

        loop {
            let next = tokio::time::timeout(self.timeout, bytes.next())
                .await
                .map_err(|_| Error::RemoteCallFailed("chat stream stalled".to_string()))?;
            let (events, ended) = match next {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| remote("chat stream read", e))?;
                    (lines.feed(&chunk), false)
                }
                None => (lines.flush(), true),
            };

            for ev in events {
                let data = match ev {
                    SseEvent::Done => return finish_stream(answer),
                    SseEvent::Data(d) => d,
                };
                let chunk: StreamChunk = serde_json::from_str(&data)
                    .map_err(|e| Error::RemoteCallFailed(format!("bad stream chunk: {e}")))?;
                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };
                if let Some(delta) = choice.delta.content.filter(|d| !d.is_empty()) {
                    answer.push_str(&delta);
                    on_delta(&delta)?;
                }
                if choice.finish_reason.is_some() {
                    return finish_stream(answer);
                }
            }

            if ended {
                return finish_stream(answer);
            }
        }
    }

    async fn summarize(&self, model: &str, turns: &[Turn]) -> Result<String> {
        let messages = summary_messages(turns)?;
        let body = ChatRequest {
            model,
            messages: &messages,
            max_tokens: None,
            n: None,
            temperature: SUMMARY_TEMPERATURE,
            presence_penalty: None,
            frequency_penalty: None,
            stream: false,
        };
        let resp = self
            .chat(&body)
            .await
            .map_err(|e| Error::SummarizationFailed(e.to_string()))?;
        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::SummarizationFailed("empty summary".to_string()))
    }

    async fn generate_image(&self, prompt: &str, size: ImageSize) -> Result<String> {
        let body = ImageRequest {
            prompt,
            n: 1,
            size: size.as_str(),
        };
        let resp = self
            .http
            .post(self.url("images/generations"))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| remote("image request", e))?;
        let resp = ensure_success(resp, "image generation").await?;
        let parsed: ImageResponse = resp
            .json()
            .await
            .map_err(|e| remote("image response", e))?;
        parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| Error::RemoteCallFailed("image generation returned no url".to_string()))
    }

    async fn transcribe(&self, audio: &Path) -> Result<String> {
        let bytes = tokio::fs::read(audio).await?;
        let file_name = audio
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("audio.ogg")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/ogg")
            .map_err(|e| remote("transcription multipart", e))?;
        let form = reqwest::multipart::Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .part("file", part);

        let resp = self
            .http
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| remote("transcription request", e))?;
        let resp = ensure_success(resp, "transcription").await?;
        let parsed: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| remote("transcription response", e))?;

        if parsed.text.trim().is_empty() {
            return Err(Error::RemoteCallFailed(
                "transcription returned empty text".to_string(),
            ));
        }
        Ok(parsed.text)
    }
}

fn finish_stream(answer: String) -> Result<String> {
    if answer.trim().is_empty() {
        return Err(Error::RemoteCallFailed(
            "chat stream returned no content".to_string(),
        ));
    }
    Ok(answer)
}

fn remote(context: &str, e: impl std::fmt::Display) -> Error {
    Error::RemoteCallFailed(format!("{context}: {e}"))
}

async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!(%status, what, "openai call failed");
    Err(Error::RemoteCallFailed(format!(
        "{what} failed: {status} {}",
        body.chars().take(200).collect::<String>()
    )))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    prompt: &'a str,
    n: u32,
    size: &'a str,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}
