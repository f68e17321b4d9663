//! Asynchronous computation and caching of class and student analyses.
//!
//! # Components
//! - [`RequestCoordinator`]: answers requests from the cache or enqueues a job
//! - [`AnalysisWorker`]: runs queued jobs through the [`Generator`]
//! - [`JobWatchdog`]: recovers jobs left stuck by crashed processes
//! - [`storage`]: cache, job and queue seams with Postgres and in-memory backends

pub mod conversations;
pub mod coordinator;
pub mod error;
pub mod generator;
pub mod hashing;
pub mod in_memory;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod storage;
pub mod watchdog;
pub mod worker;

pub use conversations::{ConversationError, ConversationStore, PgConversationStore};
pub use coordinator::RequestCoordinator;
pub use error::{AnalysisError, Result};
pub use generator::{Generator, GeneratorConfig, GeneratorError, OllamaGenerator};
pub use hashing::content_hash;
pub use metrics::AnalysisMetrics;
pub use models::{
    AnalysisRequest, AnalysisResponse, AnalysisScope, CacheRecord, CacheStatus,
    ConversationMessage, Job, JobCreation, JobStatus, JobStatusResponse,
};
pub use postgres::run_migrations;
pub use storage::{AnalysisStores, CacheStore, JobTracker, WorkQueue};
pub use watchdog::{JobWatchdog, SweepReport, WatchdogConfig, MAX_THRESHOLD_SECONDS};
pub use worker::{build_transcript, AnalysisWorker, JobOutcome, WorkerConfig};
