//! In-process fakes for the conversation store and the generator, plus a
//! harness wiring them to in-memory stores.

use async_trait::async_trait;
use classroom_insights::analysis::in_memory::{
    InMemoryCacheStore, InMemoryJobTracker, InMemoryWorkQueue,
};
use classroom_insights::analysis::{
    AnalysisMetrics, AnalysisScope, AnalysisStores, AnalysisWorker, ConversationError,
    ConversationMessage, ConversationStore, Generator, GeneratorError, JobOutcome,
    RequestCoordinator, WorkQueue, WorkerConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

#[derive(Default)]
pub struct FakeConversationStore {
    messages: RwLock<HashMap<String, Vec<ConversationMessage>>>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl FakeConversationStore {
    pub async fn set_messages(&self, scope: &AnalysisScope, messages: Vec<ConversationMessage>) {
        self.messages
            .write()
            .await
            .insert(scope.cache_key(), messages);
    }

    pub async fn push_message(&self, scope: &AnalysisScope, message: ConversationMessage) {
        self.messages
            .write()
            .await
            .entry(scope.cache_key())
            .or_default()
            .push(message);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationStore for FakeConversationStore {
    async fn get_messages(
        &self,
        scope: &AnalysisScope,
    ) -> Result<Vec<ConversationMessage>, ConversationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ConversationError::Unavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(self
            .messages
            .read()
            .await
            .get(&scope.cache_key())
            .cloned()
            .unwrap_or_default())
    }
}

/// Generator whose answers, failures and timing are set by the test.
pub struct ScriptedGenerator {
    calls: AtomicUsize,
    failure: RwLock<Option<String>>,
    delay: RwLock<Option<Duration>>,
    gate: Option<Semaphore>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failure: RwLock::new(None),
            delay: RwLock::new(None),
            gate: None,
        }
    }

    /// Every call blocks until [`release`](Self::release) is called once for it.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub async fn fail_with(&self, message: &str) {
        *self.failure.write().await = Some(message.to_string());
    }

    pub async fn succeed(&self) {
        *self.failure.write().await = None;
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn summarize(&self, transcript: &str) -> Result<String, GeneratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| GeneratorError::Provider(e.to_string()))?
                .forget();
        }
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failure.read().await.clone() {
            return Err(GeneratorError::Provider(message));
        }

        Ok(format!(
            "Analysis #{call} over {} transcript lines",
            transcript.lines().count()
        ))
    }
}

/// Coordinator and worker over in-memory stores, with handles to every part.
pub struct Harness {
    pub conversations: Arc<FakeConversationStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub cache: Arc<InMemoryCacheStore>,
    pub jobs: Arc<InMemoryJobTracker>,
    pub queue: Arc<InMemoryWorkQueue>,
    pub stores: AnalysisStores,
    pub metrics: Arc<AnalysisMetrics>,
    pub coordinator: Arc<RequestCoordinator>,
    pub worker: Arc<AnalysisWorker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_generator(ScriptedGenerator::new(), WorkerConfig::default())
    }

    pub fn with_generator(generator: ScriptedGenerator, worker_config: WorkerConfig) -> Self {
        let conversations = Arc::new(FakeConversationStore::default());
        let generator = Arc::new(generator);
        let jobs = Arc::new(InMemoryJobTracker::default());
        let cache = Arc::new(InMemoryCacheStore::new(jobs.clone()));
        let queue = Arc::new(InMemoryWorkQueue::default());
        let stores = AnalysisStores {
            cache: cache.clone(),
            jobs: jobs.clone(),
            queue: queue.clone(),
        };
        let metrics = Arc::new(AnalysisMetrics::new().unwrap());

        let coordinator = Arc::new(
            RequestCoordinator::new(conversations.clone(), stores.clone())
                .with_metrics(metrics.clone()),
        );
        let worker = Arc::new(
            AnalysisWorker::new(
                conversations.clone(),
                generator.clone(),
                stores.clone(),
                worker_config,
            )
            .with_metrics(metrics.clone()),
        );

        Self {
            conversations,
            generator,
            cache,
            jobs,
            queue,
            stores,
            metrics,
            coordinator,
            worker,
        }
    }

    /// Process every queued job in this task, returning the outcomes in order.
    pub async fn drain(&self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(job_id) = self.queue.dequeue().await.unwrap() {
            outcomes.push(self.worker.process_job(job_id).await.unwrap());
        }
        outcomes
    }
}

/// Fast polling settings for tests.
pub fn fast_polling() -> classroom_insights::client::PollingConfig {
    classroom_insights::client::PollingConfig {
        poll_interval: Duration::from_millis(20),
        request_retries: 2,
        retry_delay: Duration::from_millis(10),
        max_consecutive_poll_errors: 3,
        max_poll_duration: Some(Duration::from_secs(10)),
    }
}
