use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crossbar_channels::{ChannelPort, ChannelRegistry, SendResult};
use crossbar_core::config::{CrossbarConfig, DispatchMode};
use crossbar_core::{
    ChannelEvent, ChannelResponse, ErrorPayload, GatewayError, Result,
};
use crossbar_idempotency::{
    IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore, ProcessOutcome,
};
use crossbar_policy::{PolicyExecutor, RateScopes};
use crossbar_sessions::{InMemorySessionStore, SessionManager, SessionMessage, SessionStore};

use crate::generate::{run_generation, ResponseGenerator};
use crate::processor::{MessageProcessor, ProcessResult};
use crate::tools::{parse_direct_tool, ToolProvider};

/// Broadcast depth of the observability streams. They carry no flow
/// control: a lagging subscriber loses the oldest entries.
const STREAM_DEPTH: usize = 256;

/// Failure surfaced on the runtime's `errors` stream.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChannelRuntimeError {
    pub event: ChannelEvent,
    pub error: ErrorPayload,
    pub timestamp: DateTime<Utc>,
}

/// The event loop at the center of the gateway.
///
/// Owns the registered adapters, session manager, idempotency guard, and
/// per-platform policy executors. Every received event runs the pipeline:
/// observe → idempotency guard → policy → processor → response dispatch,
/// each event in its own task. Nothing here serializes per conversation;
/// callers needing strict ordering enqueue upstream.
pub struct ChannelRuntime {
    config: CrossbarConfig,
    registry: RwLock<ChannelRegistry>,
    sessions: Arc<SessionManager>,
    guard: Option<Arc<IdempotencyGuard>>,
    executors: DashMap<String, Arc<PolicyExecutor>>,
    generator: Option<Arc<dyn ResponseGenerator>>,
    tools: Option<Arc<dyn ToolProvider>>,
    processor: Option<Arc<dyn MessageProcessor>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    responses_tx: broadcast::Sender<ChannelResponse>,
    errors_tx: broadcast::Sender<ChannelRuntimeError>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    tracker: Mutex<TaskTracker>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    cleanups: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelRuntime {
    /// Runtime over in-memory stores with the idempotency guard enabled.
    pub fn new(config: CrossbarConfig) -> Self {
        let session_store: Arc<dyn SessionStore> =
            Arc::new(InMemorySessionStore::new(config.sessions.clone()));
        let idem_store: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());
        let (events_tx, _) = broadcast::channel(STREAM_DEPTH);
        let (responses_tx, _) = broadcast::channel(STREAM_DEPTH);
        let (errors_tx, _) = broadcast::channel(STREAM_DEPTH);
        Self {
            sessions: Arc::new(SessionManager::new(session_store, config.sessions.clone())),
            guard: Some(Arc::new(IdempotencyGuard::new(
                idem_store,
                config.idempotency.clone(),
            ))),
            config,
            registry: RwLock::new(ChannelRegistry::new()),
            executors: DashMap::new(),
            generator: None,
            tools: None,
            processor: None,
            events_tx,
            responses_tx,
            errors_tx,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            tracker: Mutex::new(TaskTracker::new()),
            readers: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    /// Swap in a durable session store. Call before `start`.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Arc::new(SessionManager::new(store, self.config.sessions.clone()));
        self
    }

    /// Swap in a durable idempotency store. Call before `start`.
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.guard = Some(Arc::new(IdempotencyGuard::new(
            store,
            self.config.idempotency.clone(),
        )));
        self
    }

    /// Disable exactly-once guarding; every delivery is processed.
    pub fn without_idempotency(mut self) -> Self {
        self.guard = None;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_tool_provider(mut self, tools: Arc<dyn ToolProvider>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Observability stream of every event entering the pipeline.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Observability stream of every successfully dispatched response.
    pub fn subscribe_responses(&self) -> broadcast::Receiver<ChannelResponse> {
        self.responses_tx.subscribe()
    }

    /// Observability stream of pipeline failures.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ChannelRuntimeError> {
        self.errors_tx.subscribe()
    }

    /// `events` as a `Stream` for combinator-style consumers. Lagging
    /// subscribers observe a `Lagged` error item instead of backpressure.
    pub fn events_stream(&self) -> BroadcastStream<ChannelEvent> {
        BroadcastStream::new(self.subscribe_events())
    }

    /// `responses` as a `Stream`.
    pub fn responses_stream(&self) -> BroadcastStream<ChannelResponse> {
        BroadcastStream::new(self.subscribe_responses())
    }

    /// `errors` as a `Stream`.
    pub fn errors_stream(&self) -> BroadcastStream<ChannelRuntimeError> {
        BroadcastStream::new(self.subscribe_errors())
    }

    /// Register an adapter. Only allowed while stopped.
    pub fn register_channel(&self, adapter: Arc<dyn ChannelPort>) -> Result<()> {
        if self.is_running() {
            return Err(GatewayError::InvalidRequest(
                "cannot register channels while the runtime is running".into(),
            ));
        }
        self.registry
            .write()
            .expect("registry lock poisoned")
            .register(adapter);
        Ok(())
    }

    /// Registered platform identifiers, sorted.
    pub fn platforms(&self) -> Vec<String> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .platforms()
    }

    /// Start every adapter and begin consuming their event streams.
    /// Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = cancel.clone();
        let tracker = TaskTracker::new();
        *self.tracker.lock().expect("tracker lock poisoned") = tracker.clone();

        {
            let mut cleanups = self.cleanups.lock().expect("cleanup lock poisoned");
            if let Some(guard) = &self.guard {
                cleanups.push(guard.start_cleanup_task(cancel.clone()));
            }
            cleanups.push(self.sessions.start_cleanup_task(cancel.clone()));
        }

        let adapters: Vec<Arc<dyn ChannelPort>> = {
            let registry = self.registry.read().expect("registry lock poisoned");
            registry.iter().map(|(_, a)| Arc::clone(a)).collect()
        };

        for adapter in adapters {
            adapter.start().await?;
            let mut rx = adapter.subscribe_events();
            let platform = adapter.platform().to_string();
            let rt = Arc::clone(self);
            let cancel = cancel.clone();
            let tracker = tracker.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = rx.recv() => match received {
                            Ok(event) => {
                                let rt = Arc::clone(&rt);
                                tracker.spawn(async move {
                                    rt.handle_event(event).await;
                                });
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(platform = %platform, missed, "event stream lagged, events dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
            self.readers.lock().expect("reader lock poisoned").push(handle);
        }

        info!(
            platforms = ?self.platforms(),
            instance = self.guard.as_deref().map(IdempotencyGuard::instance_id),
            "channel runtime started"
        );
        Ok(())
    }

    /// Unsubscribe, stop adapters, and drain in-flight pipelines for at
    /// most the configured grace period. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();

        let adapters: Vec<Arc<dyn ChannelPort>> = {
            let registry = self.registry.read().expect("registry lock poisoned");
            registry.iter().map(|(_, a)| Arc::clone(a)).collect()
        };
        for adapter in adapters {
            if let Err(e) = adapter.stop().await {
                warn!(platform = adapter.platform(), error = %e, "error stopping adapter");
            }
        }

        let tracker = self.tracker.lock().expect("tracker lock poisoned").clone();
        tracker.close();
        if tokio::time::timeout(self.config.runtime.drain_grace(), tracker.wait())
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.config.runtime.drain_grace_ms,
                "drain grace elapsed with pipelines still in flight"
            );
        }

        for handle in self.readers.lock().expect("reader lock poisoned").drain(..) {
            handle.abort();
        }
        for handle in self.cleanups.lock().expect("cleanup lock poisoned").drain(..) {
            handle.abort();
        }
        info!("channel runtime stopped");
        Ok(())
    }

    /// Stop and release the runtime. The observability streams close when
    /// the last reference to the runtime is dropped.
    pub async fn dispose(self: Arc<Self>) -> Result<()> {
        self.stop().await
    }

    /// The full pipeline for one event.
    async fn handle_event(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event.clone());
        debug!(event_id = %event.event_id, kind = ?event.kind, "event received");

        let cancel = self.cancel.lock().expect("cancel lock poisoned").clone();
        let work = || async { self.process_and_dispatch(&event).await };

        let outcome: Result<ProcessOutcome> = tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled("runtime stopping".into())),
            out = async {
                match &self.guard {
                    Some(guard) => guard.process(&event.event_id, work).await,
                    None => work().await.map(ProcessOutcome::success),
                }
            } => out,
        };

        match outcome {
            Ok(ProcessOutcome::Success { .. }) => {}
            Ok(ProcessOutcome::Failure { error }) => self.emit_error(&event, error),
            Err(err) => self.emit_error(&event, err.to_payload()),
        }
    }

    /// Policy-execute the inner processor and dispatch its response.
    /// Runs inside the idempotency guard so a redelivered event neither
    /// re-processes nor re-sends.
    async fn process_and_dispatch(&self, event: &ChannelEvent) -> Result<Option<ChannelResponse>> {
        let platform = event.conversation.platform.clone();
        let executor = self.executor_for(&platform);
        let scopes = RateScopes {
            conversation: Some(event.conversation.format()),
            user: Some(format!("{}:{}", event.sender.platform, event.sender.id)),
        };

        executor
            .execute(&scopes, || async {
                let response = self.process_event(event).await?;
                if let Some(response) = &response {
                    let result = self.dispatch(response).await?;
                    if !result.success {
                        // The adapter accepted the call but the platform
                        // refused delivery; surface it without retrying.
                        let error = result.error.clone().unwrap_or_else(|| {
                            GatewayError::Unknown("send failed".into()).to_payload()
                        });
                        warn!(event_id = %event.event_id, code = %error.code, "send reported failure");
                        self.emit_error(event, error);
                    }
                }
                Ok(response)
            })
            .await
    }

    /// Session upkeep plus mode dispatch: the part of the pipeline that
    /// produces a response.
    async fn process_event(&self, event: &ChannelEvent) -> Result<Option<ChannelResponse>> {
        let session = self.sessions.get_or_create_session(event).await?;
        let session = match event.text() {
            Some(text) => {
                self.sessions
                    .add_message(
                        &session.id,
                        SessionMessage::user(text, event.event_id.clone()),
                    )
                    .await?
            }
            None => session,
        };

        if let Some(processor) = &self.processor {
            match processor.process(event, &session).await? {
                ProcessResult::Respond(response) => {
                    self.record_assistant(&session.id, &response).await?;
                    return Ok(Some(response));
                }
                ProcessResult::NeedsTool { name, arguments } => {
                    let text = self.run_tool_to_text(&name, arguments).await?;
                    self.sessions
                        .add_message(&session.id, SessionMessage::assistant(text.clone()))
                        .await?;
                    return Ok(Some(ChannelResponse::text(event.conversation.clone(), text)));
                }
                ProcessResult::Defer => {}
                ProcessResult::Ignore => return Ok(None),
            }
        }

        match self.config.runtime.default_mode {
            DispatchMode::Llm => {
                let Some(generator) = &self.generator else {
                    return Ok(None);
                };
                let text = run_generation(
                    generator,
                    self.tools.as_ref(),
                    &self.sessions,
                    event,
                    &session.id,
                )
                .await?;
                match text {
                    Some(text) => {
                        self.sessions
                            .add_message(&session.id, SessionMessage::assistant(text.clone()))
                            .await?;
                        Ok(Some(ChannelResponse::text(event.conversation.clone(), text)))
                    }
                    None => Ok(None),
                }
            }
            DispatchMode::DirectTool => {
                let Some(text) = event.text() else {
                    return Ok(None);
                };
                let Some((name, args)) = parse_direct_tool(text) else {
                    return Ok(None);
                };
                let out = self.run_tool_to_text(&name, args).await?;
                self.sessions
                    .add_message(&session.id, SessionMessage::assistant(out.clone()))
                    .await?;
                Ok(Some(ChannelResponse::text(event.conversation.clone(), out)))
            }
            DispatchMode::Custom => Ok(None),
        }
    }

    /// Look up the adapter for the response's platform and send.
    async fn dispatch(&self, response: &ChannelResponse) -> Result<SendResult> {
        let platform = response.conversation.platform.clone();
        let adapter = {
            let registry = self.registry.read().expect("registry lock poisoned");
            registry.get(&platform).cloned()
        }
        .ok_or_else(|| {
            GatewayError::NotFound(format!("no adapter registered for platform {platform}"))
        })?;

        let result = adapter.send(response).await?;
        if result.success {
            let _ = self.responses_tx.send(response.clone());
        }
        Ok(result)
    }

    async fn run_tool_to_text(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String> {
        let Some(tools) = &self.tools else {
            return Err(GatewayError::InvalidRequest(
                "no tool provider configured".into(),
            ));
        };
        let result = tools.execute_tool(name, arguments).await?;
        Ok(if result.success {
            result.text().to_string()
        } else {
            format!("tool {name} failed: {}", result.text())
        })
    }

    async fn record_assistant(&self, session_id: &str, response: &ChannelResponse) -> Result<()> {
        if let Some(text) = response.text_content() {
            self.sessions
                .add_message(session_id, SessionMessage::assistant(text))
                .await?;
        }
        Ok(())
    }

    fn executor_for(&self, platform: &str) -> Arc<PolicyExecutor> {
        self.executors
            .entry(platform.to_string())
            .or_insert_with(|| Arc::new(PolicyExecutor::new(self.config.policy_for(platform))))
            .clone()
    }

    fn emit_error(&self, event: &ChannelEvent, error: ErrorPayload) {
        let _ = self.errors_tx.send(ChannelRuntimeError {
            event: event.clone(),
            error,
            timestamp: Utc::now(),
        });
    }
}
