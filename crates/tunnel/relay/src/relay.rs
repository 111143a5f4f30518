//! The inference relay.
//!
//! Owns the task correlation table and the per-task workers that drive the
//! engine. One worker exists per accepted task and consumes its engine
//! stream sequentially, so chunk emission for a task is serialized by
//! construction; tasks for different ids proceed concurrently, bounded per
//! device by the `engine:<device>` governor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tunnel_dispatch::{DispatchContext, DispatchError, Emitter};
use tunnel_engine::{EngineError, InferenceEngine};
use tunnel_governor::{GovernorConfig, GovernorPool};
use tunnel_session::SessionTable;
use tunnel_types::{
    DeviceId, EndpointId, Envelope, InferenceRequest, InferenceResponse, MessageFamily,
    MessageType, ResponseChunk, TaskId,
};

use crate::error::RelayError;
use crate::task::{TaskState, TaskTable};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// How long terminal task records linger for duplicate-delivery detection.
    pub retention_ms: u64,
    /// Concurrent engine invocations allowed per device.
    pub engine_concurrency: usize,
    /// Depth of each per-task delivery channel on the gateway side.
    pub delivery_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retention_ms: 60_000,
            engine_concurrency: 2,
            delivery_buffer: 64,
        }
    }
}

/// What a gateway-side subscriber receives for one submitted task.
#[derive(Clone, Debug)]
pub enum ResponseEvent {
    Chunk(ResponseChunk),
    Complete(InferenceResponse),
}

/// Relay state shared by the request/response handlers.
pub struct InferenceRelay {
    sessions: Arc<SessionTable>,
    tasks: Arc<TaskTable>,
    engine: Arc<dyn InferenceEngine>,
    governors: Arc<GovernorPool>,
    config: RelayConfig,
    local: EndpointId,
    cancellations: Arc<DashMap<TaskId, CancellationToken>>,
    deliveries: Arc<DashMap<TaskId, mpsc::Sender<ResponseEvent>>>,
}

impl InferenceRelay {
    pub fn new(
        sessions: Arc<SessionTable>,
        tasks: Arc<TaskTable>,
        engine: Arc<dyn InferenceEngine>,
        governors: Arc<GovernorPool>,
        config: RelayConfig,
        local: EndpointId,
    ) -> Self {
        Self {
            sessions,
            tasks,
            engine,
            governors,
            config,
            local,
            cancellations: Arc::new(DashMap::new()),
            deliveries: Arc::new(DashMap::new()),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskTable> {
        &self.tasks
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.config.retention_ms)
    }

    /// Income request path: validate, correlate, hand to the engine.
    #[instrument(skip(self, envelope, ctx), fields(message_type = %envelope.message_type, device_id = %ctx.device_id))]
    pub async fn accept(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let message_type = envelope.message_type;
        let reply_to = envelope.from.clone();
        let request: InferenceRequest = envelope.decode_payload()?;
        let device_id = ctx.device_id.clone();

        if !self.sessions.is_registered(&device_id) {
            return Err(DispatchError::handler(
                message_type,
                RelayError::NotRegistered(device_id),
            ));
        }

        let streaming = message_type.is_stream();
        self.tasks
            .begin(
                request.task_id.clone(),
                device_id.clone(),
                request.model.clone(),
                streaming,
            )
            .map_err(|e| DispatchError::handler(message_type, e))?;
        self.tasks.transition(&request.task_id, TaskState::Dispatched);

        let task_id = request.task_id.clone();
        let cancel = ctx.cancel.child_token();
        self.cancellations.insert(task_id.clone(), cancel.clone());

        let governor = self.governors.limiter(
            &format!("engine:{device_id}"),
            GovernorConfig {
                max_concurrency: self.config.engine_concurrency,
            },
        );

        let worker = TaskWorker {
            tasks: self.tasks.clone(),
            engine: self.engine.clone(),
            emitter: ctx.emitter.clone(),
            local: self.local.clone(),
            reply_to,
            family: message_type.family(),
            streaming,
            request,
            cancel,
        };
        let cancellations = self.cancellations.clone();
        let tasks = self.tasks.clone();

        tokio::spawn(async move {
            if governor.run(worker.run()).await.is_err() {
                // governor closed during shutdown; the task never ran
                tasks.transition(&task_id, TaskState::Cancelled);
            }
            cancellations.remove(&task_id);
        });
        Ok(())
    }

    /// Income response path (gateway side): update correlation state and
    /// deliver to the waiting subscriber. Late chunks for terminal or
    /// unknown tasks are duplicate deliveries and are dropped.
    pub async fn handle_response(
        &self,
        envelope: Envelope,
        _ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        match envelope.message_type {
            MessageType::ChatResponseStream | MessageType::CompletionResponseStream => {
                let chunk: ResponseChunk = envelope.decode_payload()?;
                if !self.tasks.is_active(&chunk.task_id) {
                    debug!(task_id = %chunk.task_id, "dropping chunk for inactive task");
                    return Ok(());
                }

                if chunk.error.is_some() {
                    self.tasks.transition(&chunk.task_id, TaskState::Failed);
                } else if chunk.done {
                    self.tasks.transition(&chunk.task_id, TaskState::Completed);
                } else {
                    self.tasks.transition(&chunk.task_id, TaskState::Streaming);
                }

                let terminal = chunk.done || chunk.error.is_some();
                let task_id = chunk.task_id.clone();
                // clone the sender out; a map guard must not live across await
                let tx = self.deliveries.get(&task_id).map(|e| e.value().clone());
                if let Some(tx) = tx {
                    if tx.send(ResponseEvent::Chunk(chunk)).await.is_err() {
                        debug!(task_id = %task_id, "subscriber gone, dropping chunk");
                    }
                }
                if terminal {
                    self.deliveries.remove(&task_id);
                }
                Ok(())
            }
            MessageType::ChatResponse | MessageType::CompletionResponse => {
                let response: InferenceResponse = envelope.decode_payload()?;
                if !self.tasks.is_active(&response.task_id) {
                    debug!(task_id = %response.task_id, "dropping response for inactive task");
                    return Ok(());
                }

                let next = if response.error.is_some() {
                    TaskState::Failed
                } else {
                    TaskState::Completed
                };
                self.tasks.transition(&response.task_id, next);

                let task_id = response.task_id.clone();
                let tx = self.deliveries.get(&task_id).map(|e| e.value().clone());
                if let Some(tx) = tx {
                    let _ = tx.send(ResponseEvent::Complete(response)).await;
                }
                self.deliveries.remove(&task_id);
                Ok(())
            }
            other => {
                debug!(message_type = %other, "response handler ignoring foreign type");
                Ok(())
            }
        }
    }

    /// Gateway-side submission: correlate the task, emit the outbound
    /// request, and return the delivery channel for its responses.
    pub async fn submit(
        &self,
        message_type: MessageType,
        device_id: DeviceId,
        request: InferenceRequest,
        ctx: &DispatchContext,
    ) -> Result<mpsc::Receiver<ResponseEvent>, DispatchError> {
        if !self.sessions.is_registered(&device_id) {
            return Err(DispatchError::handler(
                message_type,
                RelayError::NotRegistered(device_id),
            ));
        }

        let task_id = request.task_id.clone();
        self.tasks
            .begin(
                task_id.clone(),
                device_id.clone(),
                request.model.clone(),
                message_type.is_stream(),
            )
            .map_err(|e| DispatchError::handler(message_type, e))?;
        self.tasks.transition(&task_id, TaskState::Dispatched);

        let (tx, rx) = mpsc::channel(self.config.delivery_buffer);
        self.deliveries.insert(task_id.clone(), tx);

        let envelope = Envelope::encode(
            message_type,
            self.local.clone(),
            device_id.into(),
            &request,
        )?;
        if let Err(e) = ctx.emitter.emit(envelope).await {
            // never reached the device: fail the task and surface the error
            self.tasks.transition(&task_id, TaskState::Failed);
            self.deliveries.remove(&task_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Cancel a non-terminal task. The engine is signalled cooperatively and
    /// no further outcome messages are emitted for the id.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        if let Some((_, token)) = self.cancellations.remove(task_id) {
            token.cancel();
        }
        let changed = self.tasks.transition(task_id, TaskState::Cancelled);
        if changed {
            debug!(task_id = %task_id, "task cancelled");
            self.deliveries.remove(task_id);
        }
        changed
    }

    /// Drop terminal records past the retention window.
    pub fn purge_expired(&self) -> usize {
        self.tasks.purge_expired(self.retention())
    }
}

/// Drives one task to a terminal state. Single owner of the task's engine
/// stream; dropping the stream is the cooperative stop signal.
struct TaskWorker {
    tasks: Arc<TaskTable>,
    engine: Arc<dyn InferenceEngine>,
    emitter: Emitter,
    local: EndpointId,
    reply_to: EndpointId,
    family: MessageFamily,
    streaming: bool,
    request: InferenceRequest,
    cancel: CancellationToken,
}

impl TaskWorker {
    fn response_type(&self) -> MessageType {
        match (self.family, self.streaming) {
            (MessageFamily::Completion, true) => MessageType::CompletionResponseStream,
            (MessageFamily::Completion, false) => MessageType::CompletionResponse,
            (_, true) => MessageType::ChatResponseStream,
            (_, false) => MessageType::ChatResponse,
        }
    }

    async fn run(self) {
        if self.streaming {
            self.run_streaming().await;
        } else {
            self.run_complete().await;
        }
    }

    async fn emit_chunk(&self, chunk: ResponseChunk) -> Result<(), DispatchError> {
        let envelope = Envelope::encode(
            self.response_type(),
            self.local.clone(),
            self.reply_to.clone(),
            &chunk,
        )?;
        self.emitter.emit(envelope).await
    }

    async fn run_complete(self) {
        let task_id = self.request.task_id.clone();
        let call = async {
            match self.family {
                MessageFamily::Completion => self.engine.run_completion(&self.request).await,
                _ => self.engine.run_chat(&self.request).await,
            }
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.tasks.transition(&task_id, TaskState::Cancelled);
                return;
            }
            result = call => result,
        };

        let response = match result {
            Ok(output) => {
                if !self.tasks.transition(&task_id, TaskState::Completed) {
                    return;
                }
                InferenceResponse {
                    task_id: task_id.clone(),
                    model: self.request.model.clone(),
                    content: output.content,
                    usage: output.usage,
                    error: None,
                }
            }
            Err(e) => {
                if !self.tasks.transition(&task_id, TaskState::Failed) {
                    return;
                }
                InferenceResponse {
                    task_id: task_id.clone(),
                    model: self.request.model.clone(),
                    content: String::new(),
                    usage: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let envelope = Envelope::encode(
            self.response_type(),
            self.local.clone(),
            self.reply_to.clone(),
            &response,
        );
        match envelope {
            Ok(envelope) => {
                if let Err(e) = self.emitter.emit(envelope).await {
                    warn!(task_id = %task_id, error = %e, "failed to emit response");
                }
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "failed to encode response"),
        }
    }

    async fn run_streaming(self) {
        let task_id = self.request.task_id.clone();

        let open = async {
            match self.family {
                MessageFamily::Completion => self.engine.stream_completion(&self.request).await,
                _ => self.engine.stream_chat(&self.request).await,
            }
        };
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.tasks.transition(&task_id, TaskState::Cancelled);
                return;
            }
            opened = open => opened,
        };

        let mut rx = match opened {
            Ok(rx) => rx,
            Err(e) => {
                self.fail_stream(&task_id, 0, e).await;
                return;
            }
        };

        self.tasks.transition(&task_id, TaskState::Streaming);
        let mut index = 0u64;

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // dropping rx tells the engine to stop producing
                    self.tasks.transition(&task_id, TaskState::Cancelled);
                    return;
                }
                item = rx.recv() => item,
            };

            match item {
                Some(Ok(chunk)) if chunk.done => {
                    if self.tasks.transition(&task_id, TaskState::Completed) {
                        let end = ResponseChunk {
                            task_id: task_id.clone(),
                            index,
                            content: chunk.content,
                            done: true,
                            error: None,
                        };
                        if let Err(e) = self.emit_chunk(end).await {
                            warn!(task_id = %task_id, error = %e, "failed to emit stream end");
                        }
                    }
                    return;
                }
                Some(Ok(chunk)) => {
                    let out = ResponseChunk {
                        task_id: task_id.clone(),
                        index,
                        content: chunk.content,
                        done: false,
                        error: None,
                    };
                    index += 1;
                    if let Err(e) = self.emit_chunk(out).await {
                        // partial output already sent stays sent; stop here
                        warn!(task_id = %task_id, error = %e, "chunk emit failed, failing task");
                        self.tasks.transition(&task_id, TaskState::Failed);
                        return;
                    }
                }
                Some(Err(e)) => {
                    self.fail_stream(&task_id, index, e).await;
                    return;
                }
                None => {
                    self.fail_stream(
                        &task_id,
                        index,
                        EngineError::Failed("engine stream ended without sentinel".to_string()),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// Mark the task failed and emit the single error-carrying outcome.
    async fn fail_stream(&self, task_id: &TaskId, index: u64, error: EngineError) {
        if !self.tasks.transition(task_id, TaskState::Failed) {
            return;
        }
        let chunk = ResponseChunk {
            task_id: task_id.clone(),
            index,
            content: String::new(),
            done: true,
            error: Some(error.to_string()),
        };
        if let Err(e) = self.emit_chunk(chunk).await {
            warn!(task_id = %task_id, error = %e, "failed to emit stream error");
        }
    }
}
