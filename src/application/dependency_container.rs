use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::{
    AnalysisMetrics, AnalysisStores, AnalysisWorker, ConversationStore, JobWatchdog,
    OllamaGenerator, PgConversationStore, RequestCoordinator,
};
use crate::{database, Config};

/// Dependency injection container for the application
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,

    // Database layer
    pub db_pool: PgPool,

    // Storage layer
    pub stores: AnalysisStores,
    pub conversations: Arc<dyn ConversationStore>,

    // Infrastructure layer
    pub metrics: Arc<AnalysisMetrics>,
}

impl DependencyContainer {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing dependency container...");
        info!("Using database {}", config.safe_database_url());

        let db_pool =
            database::create_pool(&config.database_url, config.operational.max_db_connections)
                .await?;

        let stores = AnalysisStores::postgres(db_pool.clone());
        let conversations: Arc<dyn ConversationStore> =
            Arc::new(PgConversationStore::new(db_pool.clone()));
        let metrics =
            Arc::new(AnalysisMetrics::new().context("Failed to register analysis metrics")?);

        info!("Dependency container initialized successfully");

        Ok(Self {
            config,
            db_pool,
            stores,
            conversations,
            metrics,
        })
    }

    pub fn coordinator(&self) -> Arc<RequestCoordinator> {
        Arc::new(
            RequestCoordinator::new(self.conversations.clone(), self.stores.clone())
                .with_metrics(self.metrics.clone()),
        )
    }

    pub async fn worker(&self) -> Result<Arc<AnalysisWorker>> {
        let generator = OllamaGenerator::new(self.config.generator.clone())
            .context("Failed to create generator client")?;

        if !generator.health_check().await {
            // Jobs fail and are retried by callers until the provider is back.
            warn!(
                "Generator at {} is not reachable yet",
                self.config.generator.base_url
            );
        }

        Ok(Arc::new(
            AnalysisWorker::new(
                self.conversations.clone(),
                Arc::new(generator),
                self.stores.clone(),
                self.config.worker.clone(),
            )
            .with_metrics(self.metrics.clone()),
        ))
    }

    pub fn watchdog(&self) -> JobWatchdog {
        JobWatchdog::new(self.stores.clone(), self.config.watchdog.clone())
            .with_metrics(self.metrics.clone())
    }

    pub async fn health_check(&self) -> Result<bool> {
        database::health_check(&self.db_pool).await
    }
}
