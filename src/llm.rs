use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

use crate::config::AiModelConfig;
use crate::prompt::{PromptPayload, SamplingOptions};

/// Wire dialect spoken by the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI-compatible `/chat/completions` (OpenAI, Groq, vLLM, ...).
    #[default]
    OpenAi,
    /// Ollama `/api/chat`.
    Ollama,
}

/// Why a completion call produced no text.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Transport(String),

    #[error("completion API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("malformed stream frame: {0}")]
    MalformedFrame(String),

    #[error("failed to decode completion response: {0}")]
    Decode(String),

    #[error("no content in completion response")]
    MissingContent,
}

/// Lazy, finite sequence of text fragments. Dropping it abandons the request.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

/// A remote text-generation endpoint.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(
        &self,
        payload: &PromptPayload,
        options: &SamplingOptions,
    ) -> Result<String, CompletionError>;

    fn stream(&self, payload: &PromptPayload, options: &SamplingOptions) -> CompletionStream;
}

/// Shared HTTP client for chat-completion API calls.
pub struct CompletionClient {
    pub provider: Provider,
    pub endpoint: String,
    pub model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl CompletionClient {
    pub fn new(
        provider: Provider,
        endpoint: String,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            api_key,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &AiModelConfig) -> Self {
        Self::new(
            config.provider,
            config.endpoint.clone(),
            config.model.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn url(&self) -> String {
        match self.provider {
            Provider::OpenAi => format!("{}/chat/completions", self.endpoint),
            Provider::Ollama => format!("{}/api/chat", self.endpoint),
        }
    }

    fn request_body(&self, payload: &PromptPayload, options: &SamplingOptions, stream: bool) -> Value {
        let messages = serde_json::json!([
            { "role": "system", "content": payload.system },
            { "role": "user", "content": payload.user }
        ]);

        match self.provider {
            Provider::OpenAi => {
                let mut body = serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": options.temperature,
                    "max_tokens": options.max_tokens,
                    "stream": stream,
                });
                if let Some(top_p) = options.top_p {
                    body["top_p"] = serde_json::json!(top_p);
                }
                if options.is_json() {
                    body["response_format"] = serde_json::json!({ "type": "json_object" });
                }
                body
            }
            Provider::Ollama => {
                let mut body = serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "stream": stream,
                    "options": {
                        "temperature": options.temperature,
                        "num_predict": options.max_tokens,
                    }
                });
                if let Some(top_p) = options.top_p {
                    body["options"]["top_p"] = serde_json::json!(top_p);
                }
                if options.is_json() {
                    body["format"] = serde_json::json!("json");
                }
                body
            }
        }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let request = self.client.post(self.url()).json(body);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl Completion for CompletionClient {
    /// Send a chat request and return the response content.
    async fn complete(
        &self,
        payload: &PromptPayload,
        options: &SamplingOptions,
    ) -> Result<String, CompletionError> {
        let body = self.request_body(payload, options, false);

        let response = self
            .request(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Decode(e.to_string()))?;

        let content = match self.provider {
            Provider::OpenAi => response_json["choices"][0]["message"]["content"].as_str(),
            Provider::Ollama => response_json["message"]["content"].as_str(),
        };

        content
            .map(str::to_string)
            .ok_or(CompletionError::MissingContent)
    }

    fn stream(&self, payload: &PromptPayload, options: &SamplingOptions) -> CompletionStream {
        let request = self.request(&self.request_body(payload, options, true));
        Box::pin(stream_fragments(request, self.provider, self.timeout))
    }
}

/// `idle` bounds the wait for the response head and for each body chunk, so a
/// long answer may stream for longer than `idle` in total.
fn stream_fragments(
    request: reqwest::RequestBuilder,
    provider: Provider,
    idle: Duration,
) -> impl Stream<Item = Result<String, CompletionError>> + Send {
    async_stream::try_stream! {
        let response = tokio::time::timeout(idle, request.send())
            .await
            .map_err(|_| CompletionError::Transport(format!("no response within {:?}", idle)))?
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let status = response.status();
        let response = if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CompletionError::Status { status: status.as_u16(), body })
        }?;

        let mut decoder = FrameDecoder::new(provider);
        let mut bytes = Box::pin(response.bytes_stream());
        loop {
            let next = tokio::time::timeout(idle, bytes.next())
                .await
                .map_err(|_| CompletionError::Transport(format!("stream stalled for {:?}", idle)))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| CompletionError::Transport(e.to_string()))?;
            for fragment in decoder.push(&chunk)? {
                yield fragment;
            }
            if decoder.is_done() {
                break;
            }
        }
        for fragment in decoder.finish()? {
            yield fragment;
        }
    }
}

/// Splits a streamed response body into frames and pulls out the text deltas.
///
/// OpenAI-compatible endpoints send server-sent events (`data: {...}` lines,
/// terminated by `data: [DONE]`); Ollama sends one JSON object per line with
/// a final `"done": true`.
pub struct FrameDecoder {
    provider: Provider,
    buffer: Vec<u8>,
    done: bool,
}

impl FrameDecoder {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            buffer: Vec::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes and return the fragments of every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, CompletionError> {
        self.buffer.extend_from_slice(bytes);

        let mut fragments = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.done {
                continue;
            }
            let line = String::from_utf8(line)
                .map_err(|_| CompletionError::MalformedFrame("invalid UTF-8".to_string()))?;
            if let Some(fragment) = self.decode_line(&line)? {
                fragments.push(fragment);
            }
        }
        Ok(fragments)
    }

    /// Decode whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Result<Vec<String>, CompletionError> {
        let rest = std::mem::take(&mut self.buffer);
        if self.done || rest.is_empty() {
            return Ok(Vec::new());
        }
        let line = String::from_utf8(rest)
            .map_err(|_| CompletionError::MalformedFrame("invalid UTF-8".to_string()))?;
        Ok(self.decode_line(&line)?.into_iter().collect())
    }

    fn decode_line(&mut self, line: &str) -> Result<Option<String>, CompletionError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let frame = match self.provider {
            Provider::OpenAi => {
                // SSE comments and non-data fields carry no content
                if line.starts_with(':')
                    || line.starts_with("event:")
                    || line.starts_with("id:")
                    || line.starts_with("retry:")
                {
                    return Ok(None);
                }
                let data = line
                    .strip_prefix("data:")
                    .ok_or_else(|| CompletionError::MalformedFrame(line.to_string()))?
                    .trim();
                if data == "[DONE]" {
                    self.done = true;
                    return Ok(None);
                }
                parse_frame(data)?
            }
            Provider::Ollama => {
                let frame = parse_frame(line)?;
                if frame["done"].as_bool() == Some(true) {
                    self.done = true;
                }
                frame
            }
        };

        if let Some(error) = frame.get("error") {
            return Err(CompletionError::MalformedFrame(format!("upstream error: {}", error)));
        }

        let content = match self.provider {
            Provider::OpenAi => frame["choices"][0]["delta"]["content"].as_str(),
            Provider::Ollama => frame["message"]["content"].as_str(),
        };

        Ok(content.filter(|c| !c.is_empty()).map(str::to_string))
    }
}

fn parse_frame(data: &str) -> Result<Value, CompletionError> {
    serde_json::from_str(data).map_err(|e| CompletionError::MalformedFrame(format!("{}: {}", e, data)))
}
