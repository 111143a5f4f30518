//! Inference engine boundary.
//!
//! The relay never runs models itself; it hands validated requests to an
//! [`InferenceEngine`] and forwards what comes back. Streaming output is a
//! lazy, finite, non-restartable sequence of chunks ending in a `done`
//! sentinel. Cancellation is cooperative: dropping the chunk receiver is the
//! stop signal, and producers must give up once their sends start failing.

#![deny(unsafe_code)]

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tunnel_types::{InferenceRequest, Usage};

/// One streamed output fragment. `done = true` closes the stream; no chunk
/// follows it.
#[derive(Clone, Debug)]
pub struct EngineChunk {
    pub content: String,
    pub done: bool,
}

/// Complete (non-streaming) engine output.
#[derive(Clone, Debug)]
pub struct EngineResult {
    pub content: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("inference failed: {0}")]
    Failed(String),
}

/// Stream of chunk results handed to the relay.
pub type ChunkStream = mpsc::Receiver<Result<EngineChunk, EngineError>>;

/// Trait implemented by inference engine collaborators.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn run_chat(&self, request: &InferenceRequest) -> Result<EngineResult, EngineError>;

    async fn run_completion(&self, request: &InferenceRequest)
        -> Result<EngineResult, EngineError>;

    async fn stream_chat(&self, request: &InferenceRequest) -> Result<ChunkStream, EngineError>;

    async fn stream_completion(
        &self,
        request: &InferenceRequest,
    ) -> Result<ChunkStream, EngineError>;
}

/// Deterministic in-memory engine for tests and offline development.
///
/// Echoes the request input back through the configured model name, split
/// into per-word chunks when streaming. Failure injection covers both the
/// call itself and a mid-stream abort.
#[derive(Clone, Debug, Default)]
pub struct EchoEngine {
    /// Fail every call with [`EngineError::Failed`].
    pub fail_calls: bool,
    /// Emit this many chunks, then yield an error instead of the sentinel.
    pub fail_after_chunks: Option<usize>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn reply_text(request: &InferenceRequest) -> String {
        let input = request
            .prompt
            .clone()
            .or_else(|| request.messages.last().map(|m| m.content.clone()))
            .unwrap_or_default();
        format!("{}: {}", request.model, input)
    }

    fn usage_for(text: &str) -> Usage {
        let completion_tokens = text.split_whitespace().count() as u32;
        Usage {
            prompt_tokens: 0,
            completion_tokens,
            total_tokens: completion_tokens,
        }
    }

    fn run(&self, request: &InferenceRequest) -> Result<EngineResult, EngineError> {
        if self.fail_calls {
            return Err(EngineError::Failed("injected failure".to_string()));
        }
        let content = Self::reply_text(request);
        let usage = Self::usage_for(&content);
        Ok(EngineResult {
            content,
            usage: Some(usage),
        })
    }

    fn stream(&self, request: &InferenceRequest) -> Result<ChunkStream, EngineError> {
        if self.fail_calls {
            return Err(EngineError::Failed("injected failure".to_string()));
        }

        let text = Self::reply_text(request);
        let fail_after = self.fail_after_chunks;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
            for (index, word) in words.iter().enumerate() {
                if fail_after == Some(index) {
                    let _ = tx
                        .send(Err(EngineError::Failed("stream aborted".to_string())))
                        .await;
                    return;
                }
                let chunk = EngineChunk {
                    content: format!("{word} "),
                    done: false,
                };
                // A failed send means the consumer cancelled; stop producing.
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(EngineChunk {
                    content: String::new(),
                    done: true,
                }))
                .await;
        });

        Ok(rx)
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn run_chat(&self, request: &InferenceRequest) -> Result<EngineResult, EngineError> {
        self.run(request)
    }

    async fn run_completion(
        &self,
        request: &InferenceRequest,
    ) -> Result<EngineResult, EngineError> {
        self.run(request)
    }

    async fn stream_chat(&self, request: &InferenceRequest) -> Result<ChunkStream, EngineError> {
        self.stream(request)
    }

    async fn stream_completion(
        &self,
        request: &InferenceRequest,
    ) -> Result<ChunkStream, EngineError> {
        self.stream(request)
    }
}
