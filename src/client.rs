use anyhow::Result;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::aggregate::TokenUsage;
use crate::metrics::ErrorType;
use crate::tokenizer::Tokenizer;

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP {status} client error: {message}")]
    Http4xx { status: u16, message: String },

    #[error("HTTP {status} server error: {message}")]
    Http5xx { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Server error event: {0}")]
    Api(String),

    #[error("Stream closed before the first chunk")]
    StreamClosed,

    #[error("Other error: {0}")]
    Other(String),
}

impl ClientError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ClientError::Connection(_) => ErrorType::Connection,
            ClientError::Http4xx { status, .. } => ErrorType::Http4xx(*status),
            ClientError::Http5xx { status, .. } => ErrorType::Http5xx(*status),
            ClientError::Parse(_) => ErrorType::Parse,
            ClientError::Timeout(_) => ErrorType::Timeout,
            ClientError::Api(_) | ClientError::StreamClosed | ClientError::Other(_) => ErrorType::Other,
        }
    }

    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            ClientError::Timeout(timeout)
        } else if e.is_connect() {
            ClientError::Connection(e.to_string())
        } else if e.is_decode() {
            ClientError::Parse(e.to_string())
        } else if e.is_request() || e.is_body() {
            let msg = e.to_string();
            if msg.contains("connection closed")
                || msg.contains("connection reset")
                || msg.contains("broken pipe")
                || msg.contains("connection refused")
            {
                ClientError::Connection(format!("Request error: {}", msg))
            } else {
                ClientError::Other(format!("Request error: {}", msg))
            }
        } else {
            ClientError::Other(e.to_string())
        }
    }

    fn from_status(status: u16, message: String) -> Self {
        match status {
            400..=499 => ClientError::Http4xx { status, message },
            500..=599 => ClientError::Http5xx { status, message },
            _ => ClientError::Other(format!("HTTP {}: {}", status, message)),
        }
    }
}

/// Where in a worker's single attempt a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Transport or auth failure before any response data.
    StreamOpen,
    /// Stream opened but no chunk arrived, or it errored first.
    FirstChunk,
    /// Non-streaming exchange failed or timed out.
    Exchange,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureStage::StreamOpen => write!(f, "stream open"),
            FailureStage::FirstChunk => write!(f, "first chunk"),
            FailureStage::Exchange => write!(f, "exchange"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatCompletionRequest {
    /// System + user chat request at temperature 1.
    pub fn new(model: &str, prompt: &str, max_tokens: u32, stream: bool) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: Some(max_tokens),
            temperature: Some(1.0),
            stream: Some(stream),
        }
    }

    /// The user turn, which is what workers vary.
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub owned_by: String,
}

/// Error object servers may send in place of a payload, even with status 200.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: serde_json::Value,
}

impl ErrorEnvelope {
    fn message(&self) -> String {
        match self.error.get("message").and_then(|m| m.as_str()) {
            Some(message) => message.to_string(),
            None => self.error.to_string(),
        }
    }
}

/// Decode a chunk or response body, rejecting `{"error": ...}` payloads.
pub(crate) fn parse_payload<T: DeserializeOwned>(json: &str) -> Result<T, ClientError> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(json) {
        return Err(ClientError::Api(envelope.message()));
    }
    serde_json::from_str(json).map_err(|e| ClientError::Parse(e.to_string()))
}

/// Result of one non-streaming exchange.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// A single logical request/response exchange with a chat-completion endpoint.
///
/// Workers own their cancellation: dropping a returned future (or stream)
/// abandons the in-flight request.
pub trait CompletionClient: Send + Sync + 'static {
    type Stream: ChunkStream + Send + 'static;

    /// Send a streaming request and return once response headers arrive.
    fn open_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> impl Future<Output = Result<Self::Stream, ClientError>> + Send;

    /// Perform a full non-streaming exchange.
    fn complete(
        &self,
        request: ChatCompletionRequest,
    ) -> impl Future<Output = Result<Completion, ClientError>> + Send;
}

pub trait ChunkStream {
    /// Next parsed chunk, or `None` once the server signals the end.
    fn next_chunk(
        &mut self,
    ) -> impl Future<Output = Result<Option<ChatCompletionChunk>, ClientError>> + Send;
}

/// Configuration for creating an OpenAI client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the OpenAI-compatible API endpoint
    pub base_url: String,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    /// Model name, used to pick a tokenizer when the server omits usage
    pub model: String,
    /// HTTP client timeout
    pub timeout: Duration,
    /// Connection pool size (should match the largest concurrency level)
    pub pool_size: usize,
}

#[derive(Clone)]
pub struct OpenAIClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    tokenizer: Arc<Tokenizer>,
}

impl OpenAIClient {
    /// Creates a new OpenAI-compatible HTTP client with connection pooling.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_speed_bench::client::{ClientConfig, OpenAIClient};
    /// use std::time::Duration;
    ///
    /// let client = OpenAIClient::new(ClientConfig {
    ///     base_url: "http://localhost:8080/v1".to_string(),
    ///     api_key: None,
    ///     model: "llama-3.1-8b".to_string(),
    ///     timeout: Duration::from_secs(120),
    ///     pool_size: 64,
    /// })
    /// .unwrap();
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_size)
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            timeout: config.timeout,
            tokenizer: Arc::new(Tokenizer::new(&config.model)?),
        })
    }

    fn post(&self, request: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(request);
        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }
        req
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self
            .post(request)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(ClientError::from_status(status, text));
        }

        Ok(response)
    }

    fn estimate_usage(&self, request: &ChatCompletionRequest, text: &str) -> TokenUsage {
        let prompt_tokens = request
            .messages
            .iter()
            .map(|m| self.tokenizer.count_tokens(&m.content) as u64)
            .sum();
        TokenUsage {
            prompt_tokens,
            completion_tokens: self.tokenizer.count_tokens(text) as u64,
        }
    }
}

impl CompletionClient for OpenAIClient {
    type Stream = StreamResponse;

    async fn open_stream(
        &self,
        mut request: ChatCompletionRequest,
    ) -> Result<StreamResponse, ClientError> {
        request.stream = Some(true);
        let response = self.send(&request).await?;
        Ok(StreamResponse {
            response,
            decoder: SseDecoder::default(),
            timeout: self.timeout,
        })
    }

    async fn complete(&self, mut request: ChatCompletionRequest) -> Result<Completion, ClientError> {
        request.stream = Some(false);
        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::from_reqwest(e, self.timeout))?;
        let completion: ChatCompletionResponse = parse_payload(&body)?;

        let text = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        let usage = match completion.usage {
            Some(usage) => TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
            None => {
                log::debug!("Response {} carried no usage, estimating with tokenizer", completion.id);
                self.estimate_usage(&request, &text)
            }
        };

        Ok(Completion { text, usage })
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Chunk(String),
    Done,
    Skip,
}

fn classify_sse_line(line: &str) -> SseLine {
    let line = line.trim_end_matches('\r');
    match line.strip_prefix("data:") {
        Some(data) => {
            let data = data.trim_start();
            if data == "[DONE]" {
                SseLine::Done
            } else if data.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Chunk(data.to_string())
            }
        }
        None => SseLine::Skip,
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    /// `[DONE]` or end of body.
    End,
    /// No complete line buffered yet.
    Pending,
}

/// Splits a response body into SSE events. Raw bytes are held until a whole
/// line is buffered, so characters split across network reads stay intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    eof: bool,
    done: bool,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// The body ended; a trailing line without a newline still counts.
    fn finish(&mut self) {
        self.eof = true;
    }

    fn next_line(&mut self) -> Option<String> {
        let line = match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                line
            }
            None if self.eof && !self.buffer.is_empty() => std::mem::take(&mut self.buffer),
            None => return None,
        };
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn next_event(&mut self) -> SseEvent {
        if self.done {
            return SseEvent::End;
        }
        while let Some(line) = self.next_line() {
            match classify_sse_line(&line) {
                SseLine::Done => {
                    self.done = true;
                    return SseEvent::End;
                }
                SseLine::Chunk(json) => return SseEvent::Data(json),
                SseLine::Skip => {}
            }
        }
        if self.eof {
            self.done = true;
            SseEvent::End
        } else {
            SseEvent::Pending
        }
    }
}

/// Server-sent-event stream of chat completion chunks. Dropping it closes
/// the connection.
pub struct StreamResponse {
    response: reqwest::Response,
    decoder: SseDecoder,
    timeout: Duration,
}

impl ChunkStream for StreamResponse {
    async fn next_chunk(&mut self) -> Result<Option<ChatCompletionChunk>, ClientError> {
        loop {
            match self.decoder.next_event() {
                SseEvent::Data(json) => return parse_payload(&json).map(Some),
                SseEvent::End => return Ok(None),
                SseEvent::Pending => match self
                    .response
                    .chunk()
                    .await
                    .map_err(|e| ClientError::from_reqwest(e, self.timeout))?
                {
                    Some(bytes) => self.decoder.push(&bytes),
                    None => self.decoder.finish(),
                },
            }
        }
    }
}

/// Wait for the server to become ready by polling the /models endpoint.
///
/// Any OpenAI-compatible backend serves /models, and a successful listing
/// means the server can take requests, not merely that it is alive.
pub async fn check_server_ready(
    base_url: &str,
    api_key: Option<&str>,
    total_timeout: Duration,
    retry_interval: Duration,
) -> Result<()> {
    let start_time = Instant::now();
    let mut attempt = 0;

    log::info!("Waiting for server to be ready at {}...", base_url);

    loop {
        attempt += 1;
        log::debug!("Server readiness check attempt {}: GET {}/models", attempt, base_url);

        match list_models(base_url, api_key, Duration::from_secs(10)).await {
            Ok(models) => {
                log::info!(
                    "Server is ready ({} model{} available after {:.1}s)",
                    models.len(),
                    if models.len() == 1 { "" } else { "s" },
                    start_time.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            Err(e) => log::debug!("Models endpoint returned error: {}", e),
        }

        let remaining = total_timeout.saturating_sub(start_time.elapsed());
        if remaining.is_zero() {
            anyhow::bail!(
                "Server readiness timeout after {:.1}s. Server at {} did not become ready.",
                total_timeout.as_secs_f64(),
                base_url
            );
        }

        tokio::time::sleep(retry_interval.min(remaining)).await;
    }
}

pub async fn list_models(
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Model>> {
    let client = Client::builder().timeout(timeout).build()?;

    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let mut req = client.get(&url);
    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }

    let response = req
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query models endpoint: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        anyhow::bail!("Models endpoint returned {}: {}", status, text);
    }

    let models: ModelsResponse = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse models response: {}", e))?;

    Ok(models.data)
}

/// First model the server lists.
pub async fn detect_model(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<String> {
    let models = list_models(base_url, api_key, timeout).await?;

    let Some(first) = models.first() else {
        anyhow::bail!("No models available from server at {}/models", base_url);
    };

    if models.len() > 1 {
        log::info!("Found {} models, using: {}", models.len(), first.id);
        log::debug!(
            "Available models: {:?}",
            models.iter().map(|m| &m.id).collect::<Vec<_>>()
        );
    } else {
        log::info!("Detected model: {}", first.id);
    }

    Ok(first.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sse_line() {
        assert_eq!(classify_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(classify_sse_line("data:[DONE]\r"), SseLine::Done);
        assert_eq!(
            classify_sse_line("data: {\"id\":\"x\"}"),
            SseLine::Chunk("{\"id\":\"x\"}".to_string())
        );
        assert_eq!(classify_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(classify_sse_line(""), SseLine::Skip);
        assert_eq!(classify_sse_line("event: message"), SseLine::Skip);
    }

    #[test]
    fn test_chunk_parses_role_only_delta() {
        let json = r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.choices.len(), 1);
        assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_response_without_usage() {
        let json = r#"{"id":"r1","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#;
        let response: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert!(response.usage.is_none());
        assert_eq!(response.choices[0].message.content, "hi");
    }

    #[test]
    fn test_request_shape() {
        let request = ChatCompletionRequest::new("m", "say hi", 64, true);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], SYSTEM_PROMPT);
        assert_eq!(value["messages"][1]["content"], "say hi");
        assert_eq!(value["max_tokens"], 64);
        assert_eq!(value["temperature"], 1.0);
        assert_eq!(value["stream"], true);
        assert_eq!(request.prompt(), "say hi");
    }

    const ERROR_EVENT: &str =
        r#"{"error":{"message":"model overloaded","type":"server_error","code":503}}"#;

    #[test]
    fn test_error_event_is_not_a_chunk() {
        let err = parse_payload::<ChatCompletionChunk>(ERROR_EVENT).unwrap_err();
        assert!(matches!(err, ClientError::Api(ref m) if m == "model overloaded"));
        assert_eq!(err.error_type(), ErrorType::Other);

        let err = parse_payload::<ChatCompletionChunk>(r#"{"error":"bad gateway"}"#).unwrap_err();
        assert!(matches!(err, ClientError::Api(ref m) if m.contains("bad gateway")));
    }

    #[test]
    fn test_error_body_is_not_a_completion() {
        let err = parse_payload::<ChatCompletionResponse>(ERROR_EVENT).unwrap_err();
        assert!(matches!(err, ClientError::Api(_)));
    }

    #[test]
    fn test_payload_without_choices_is_rejected() {
        assert!(matches!(
            parse_payload::<ChatCompletionChunk>(r#"{"id":"c1","model":"m"}"#),
            Err(ClientError::Parse(_))
        ));
        assert!(matches!(
            parse_payload::<ChatCompletionResponse>(r#"{"id":"r1"}"#),
            Err(ClientError::Parse(_))
        ));
    }

    #[test]
    fn test_decoder_joins_line_split_across_reads() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: {\"choi");
        assert_eq!(decoder.next_event(), SseEvent::Pending);
        decoder.push(b"ces\":[]}\n\n");
        assert_eq!(decoder.next_event(), SseEvent::Data("{\"choices\":[]}".to_string()));
        assert_eq!(decoder.next_event(), SseEvent::Pending);
    }

    #[test]
    fn test_decoder_flushes_trailing_line_at_eof() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: {\"choices\":[]}");
        assert_eq!(decoder.next_event(), SseEvent::Pending);
        decoder.finish();
        assert_eq!(decoder.next_event(), SseEvent::Data("{\"choices\":[]}".to_string()));
        assert_eq!(decoder.next_event(), SseEvent::End);
    }

    #[test]
    fn test_decoder_done_before_any_data_ends_stream() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: [DONE]\n\ndata: {\"choices\":[]}\n");
        assert_eq!(decoder.next_event(), SseEvent::End);
        assert_eq!(decoder.next_event(), SseEvent::End);
    }

    #[test]
    fn test_decoder_skips_comments_before_first_chunk() {
        let mut decoder = SseDecoder::default();
        decoder.push(b": keep-alive\r\n\r\nevent: message\r\n");
        assert_eq!(decoder.next_event(), SseEvent::Pending);
        decoder.push(b"data: {\"choices\":[]}\r\n");
        assert_eq!(decoder.next_event(), SseEvent::Data("{\"choices\":[]}".to_string()));
    }

    #[test]
    fn test_decoder_keeps_multibyte_char_split_across_reads() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"text\":\"caf\u{e9}\"}\n".as_bytes();
        let split = line.len() - 4;
        decoder.push(&line[..split]);
        assert_eq!(decoder.next_event(), SseEvent::Pending);
        decoder.push(&line[split..]);
        assert_eq!(
            decoder.next_event(),
            SseEvent::Data("{\"text\":\"caf\u{e9}\"}".to_string())
        );
    }

    #[test]
    fn test_empty_body_ends_without_chunk() {
        let mut decoder = SseDecoder::default();
        decoder.finish();
        assert_eq!(decoder.next_event(), SseEvent::End);
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ClientError::from_status(401, "no".into()),
            ClientError::Http4xx { status: 401, .. }
        ));
        assert!(matches!(
            ClientError::from_status(503, "busy".into()),
            ClientError::Http5xx { status: 503, .. }
        ));
        assert!(matches!(
            ClientError::from_status(302, "moved".into()),
            ClientError::Other(_)
        ));
        assert!(matches!(ClientError::StreamClosed.error_type(), ErrorType::Other));
    }
}
