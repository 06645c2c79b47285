//! Language model client.
//!
//! [`LanguageModel`] is the seam between the pipeline and a chat
//! completion backend. [`OpenAiCompatModel`] speaks the OpenAI
//! `/chat/completions` protocol, which LM Studio, vLLM, Ollama's
//! compatibility layer and most hosted providers also accept.
//!
//! Streaming returns a [`TokenStream`]: a bounded channel fed by a reader
//! task. Dropping the receiver makes the reader stop and drop the HTTP
//! response, which aborts the upstream generation.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::error::{RagError, RagResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Incremental completion text. Ends when the sender is dropped; an `Err`
/// item is always the last one.
pub type TokenStream = mpsc::Receiver<RagResult<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Full completion in one call.
    async fn complete(&self, messages: &[ChatMessage]) -> RagResult<String>;

    /// Token-by-token completion. Failing to start is a
    /// [`RagError::ModelService`]; failures after the first token arrive
    /// on the stream as [`RagError::Generation`].
    async fn stream(&self, messages: &[ChatMessage]) -> RagResult<TokenStream>;
}

// ============ Disabled ============

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> RagResult<String> {
        Err(RagError::model("language model is disabled"))
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> RagResult<TokenStream> {
        Err(RagError::model("language model is disabled"))
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiCompatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_retries: u32,
    timeout: Duration,
}

impl OpenAiCompatModel {
    /// The API key is read from `config.api_key_env`; local servers that
    /// need no key work without it.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        // No client-wide deadline: it would cut long streams short.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            timeout,
        })
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": stream,
        });
        let mut req = self.client.post(&self.endpoint).json(&body);
        if !stream {
            req = req.timeout(self.timeout);
        }
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, ?delay, error = ?last_err, "retrying chat completion");
                tokio::time::sleep(delay).await;
            }
            match self.request(messages, stream).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("LLM API error {}: {}", status, body));
                        continue;
                    }
                    bail!("LLM API error {}: {}", status, body);
                }
                Err(e) => last_err = Some(format!("LLM request failed: {}", e)),
            }
        }
        Err(anyhow!(last_err.unwrap_or_else(|| "LLM request failed".into())))
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> RagResult<String> {
        let response = self
            .send(messages, false)
            .await
            .map_err(|e| RagError::model(e.to_string()))?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| RagError::model(format!("invalid completion response: {}", e)))?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RagError::model("completion response has no content"))
    }

    async fn stream(&self, messages: &[ChatMessage]) -> RagResult<TokenStream> {
        let response = self
            .send(messages, true)
            .await
            .map_err(|e| RagError::model(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => {
                        tracing::debug!("token receiver dropped, aborting completion stream");
                        return;
                    }
                    item = body.next() => item,
                };
                let bytes = match item {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(RagError::Generation(e.to_string()))).await;
                        return;
                    }
                    None => {
                        // A final line without a trailing newline.
                        if let Some(SseLine::Token(t)) =
                            parse_sse_line(String::from_utf8_lossy(&pending).trim())
                        {
                            let _ = tx.send(Ok(t)).await;
                        }
                        return;
                    }
                };

                pending.extend_from_slice(&bytes);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let event = match parse_sse_line(line.trim()) {
                        Some(event) => event,
                        None => continue,
                    };
                    let sent = match event {
                        SseLine::Done => return,
                        SseLine::Token(t) => tx.send(Ok(t)).await,
                        SseLine::Error(msg) => {
                            let _ = tx.send(Err(RagError::Generation(msg))).await;
                            return;
                        }
                    };
                    if sent.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Error(String),
}

/// Interpret one SSE line of a streamed chat completion. Comments,
/// keep-alives, role-only deltas and empty content yield `None`.
fn parse_sse_line(line: &str) -> Option<SseLine> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseLine::Done);
    }
    let json: Value = serde_json::from_str(data).ok()?;
    if let Some(err) = json.get("error") {
        let msg = err["message"].as_str().unwrap_or("upstream error").to_string();
        return Some(SseLine::Error(msg));
    }
    json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|c| !c.is_empty())
        .map(|c| SseLine::Token(c.to_string()))
}

pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAiCompatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;

    #[test]
    fn sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            Some(SseLine::Token("Hi".into()))
        );
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseLine::Done));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"overloaded"}}"#),
            Some(SseLine::Error("overloaded".into()))
        );
    }

    async fn serve(body: &'static str) -> String {
        let app = Router::new().route("/v1/chat/completions", post(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn config(base_url: String) -> LlmConfig {
        LlmConfig {
            provider: "openai".into(),
            base_url,
            api_key_env: "ZERAG_TEST_UNSET_KEY".into(),
            max_retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn streams_tokens_until_done() {
        let base = serve(concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ))
        .await;
        let model = OpenAiCompatModel::new(&config(base)).unwrap();
        let mut rx = model.stream(&[ChatMessage::user("hi")]).await.unwrap();
        let mut out = Vec::new();
        while let Some(tok) = rx.recv().await {
            out.push(tok.unwrap());
        }
        assert_eq!(out, vec!["Hel", "lo"]);
    }

    /// Three tokens then `[DONE]`, each frame 400ms after the last.
    fn slow_frames() -> axum::body::Body {
        let frames = futures::stream::unfold(0u8, |n| async move {
            if n == 4 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
            let frame = if n == 3 {
                "data: [DONE]\n\n".to_string()
            } else {
                format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"t{}\"}}}}]}}\n\n", n)
            };
            Some((Ok::<_, std::io::Error>(frame), n + 1))
        });
        axum::body::Body::from_stream(frames)
    }

    #[tokio::test]
    async fn slow_streams_outlive_the_read_timeout() {
        let app = Router::new().route("/v1/chat/completions", post(|| async { slow_frames() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = config(format!("http://{}/v1", addr));
        cfg.timeout_secs = 1;
        let model = OpenAiCompatModel::new(&cfg).unwrap();
        let started = std::time::Instant::now();
        let mut rx = model.stream(&[ChatMessage::user("hi")]).await.unwrap();
        let mut out = Vec::new();
        while let Some(tok) = rx.recv().await {
            out.push(tok.unwrap());
        }
        assert_eq!(out, vec!["t0", "t1", "t2"]);
        assert!(started.elapsed() > Duration::from_secs(1));
    }

    #[tokio::test]
    async fn one_shot_completions_keep_a_deadline() {
        let app = Router::new().route("/v1/chat/completions", post(|| async { slow_frames() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = config(format!("http://{}/v1", addr));
        cfg.timeout_secs = 1;
        let model = OpenAiCompatModel::new(&cfg).unwrap();
        let started = std::time::Instant::now();
        assert!(model.complete(&[ChatMessage::user("q")]).await.is_err());
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn completes_in_one_call() {
        let base = serve(r#"{"choices":[{"message":{"role":"assistant","content":"Forty-two"}}]}"#)
            .await;
        let model = OpenAiCompatModel::new(&config(base)).unwrap();
        assert_eq!(
            model.complete(&[ChatMessage::user("q")]).await.unwrap(),
            "Forty-two"
        );
    }

    #[tokio::test]
    async fn disabled_model_is_a_model_service_error() {
        assert!(matches!(
            DisabledModel.complete(&[]).await,
            Err(RagError::ModelService(_))
        ));
        assert!(create_model(&LlmConfig::default()).is_ok());
    }
}
