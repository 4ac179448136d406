//! Scripted in-memory completion client for exercising the prober and runner.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::aggregate::TokenUsage;
use crate::client::{
    ChatCompletionChunk, ChatCompletionRequest, ChunkStream, ClientError, Completion,
    CompletionClient, Delta, StreamChoice, parse_payload,
};

#[derive(Debug, Clone)]
pub enum Script {
    /// Stream opens at once and its first chunk arrives after the delay.
    Stream(Duration),
    OpenError,
    StreamError,
    EmptyStream,
    /// Stream opens at once and its first `data:` payload is this raw JSON.
    Payload(String),
    /// Non-streaming exchange answering after the delay.
    Complete(Duration, TokenUsage),
    ExchangeError,
}

impl Script {
    pub fn ttft_ms(ms: u64) -> Self {
        Script::Stream(Duration::from_millis(ms))
    }

    pub fn complete(ms: u64, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Script::Complete(
            Duration::from_millis(ms),
            TokenUsage {
                prompt_tokens,
                completion_tokens,
            },
        )
    }
}

#[derive(Default)]
struct Tallies {
    chunks_read: AtomicUsize,
    streams_dropped: AtomicUsize,
}

pub struct ScriptedClient {
    streams: Mutex<VecDeque<Script>>,
    completions: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<String>>,
    tallies: Arc<Tallies>,
}

impl ScriptedClient {
    pub fn new(streams: Vec<Script>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            completions: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            tallies: Arc::new(Tallies::default()),
        }
    }

    pub fn uniform(script: Script, count: usize) -> Self {
        Self::new(vec![script; count])
    }

    pub fn with_completions(self, completions: Vec<Script>) -> Self {
        *self.completions.lock().unwrap() = completions.into();
        self
    }

    /// Every prompt received, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn chunks_read(&self) -> usize {
        self.tallies.chunks_read.load(Ordering::SeqCst)
    }

    pub fn streams_dropped(&self) -> usize {
        self.tallies.streams_dropped.load(Ordering::SeqCst)
    }

    fn next(&self, queue: &Mutex<VecDeque<Script>>, request: &ChatCompletionRequest) -> Option<Script> {
        self.prompts.lock().unwrap().push(request.prompt().to_string());
        queue.lock().unwrap().pop_front()
    }
}

enum StreamMode {
    Chunk,
    Error,
    Empty,
    Payload(String),
}

pub struct ScriptedStream {
    delay: Duration,
    mode: StreamMode,
    tallies: Arc<Tallies>,
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.tallies.streams_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl ChunkStream for ScriptedStream {
    async fn next_chunk(&mut self) -> Result<Option<ChatCompletionChunk>, ClientError> {
        tokio::time::sleep(self.delay).await;
        match &self.mode {
            StreamMode::Chunk => {
                self.tallies.chunks_read.fetch_add(1, Ordering::SeqCst);
                Ok(Some(ChatCompletionChunk {
                    id: "chunk".to_string(),
                    model: "scripted".to_string(),
                    choices: vec![StreamChoice {
                        delta: Delta {
                            role: Some("assistant".to_string()),
                            content: None,
                        },
                        ..Default::default()
                    }],
                }))
            }
            StreamMode::Error => Err(ClientError::Other("stream reset".to_string())),
            StreamMode::Empty => Ok(None),
            StreamMode::Payload(json) => parse_payload(json).map(Some),
        }
    }
}

impl CompletionClient for ScriptedClient {
    type Stream = ScriptedStream;

    async fn open_stream(&self, request: ChatCompletionRequest) -> Result<ScriptedStream, ClientError> {
        let stream = |delay, mode| ScriptedStream {
            delay,
            mode,
            tallies: Arc::clone(&self.tallies),
        };
        match self.next(&self.streams, &request) {
            Some(Script::Stream(delay)) => Ok(stream(delay, StreamMode::Chunk)),
            Some(Script::StreamError) => Ok(stream(Duration::ZERO, StreamMode::Error)),
            Some(Script::EmptyStream) => Ok(stream(Duration::ZERO, StreamMode::Empty)),
            Some(Script::Payload(json)) => Ok(stream(Duration::ZERO, StreamMode::Payload(json))),
            Some(Script::OpenError) => Err(ClientError::Connection("refused".to_string())),
            other => Err(ClientError::Other(format!("unscripted stream: {:?}", other))),
        }
    }

    async fn complete(&self, request: ChatCompletionRequest) -> Result<Completion, ClientError> {
        match self.next(&self.completions, &request) {
            Some(Script::Complete(delay, usage)) => {
                tokio::time::sleep(delay).await;
                Ok(Completion {
                    text: String::new(),
                    usage,
                })
            }
            Some(Script::ExchangeError) => Err(ClientError::Http5xx {
                status: 503,
                message: "overloaded".to_string(),
            }),
            other => Err(ClientError::Other(format!("unscripted completion: {:?}", other))),
        }
    }
}
