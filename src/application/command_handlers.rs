use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::analysis::{run_migrations, AnalysisScope};
use crate::api::{create_api_router, AppState};
use crate::application::{ApplicationLifecycle, DependencyContainer};
use crate::client::{AnalysisState, ClientError, HttpAnalysisClient, PollingClient};
use crate::Config;

/// Clean separation of command handling logic from main.rs
pub struct DatabaseCommandHandler {
    container: Arc<DependencyContainer>,
}

impl DatabaseCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("Running analysis schema migrations...");
        run_migrations(&self.container.db_pool)
            .await
            .context("Migration failed")?;
        info!("Migrations completed");
        Ok(())
    }
}

pub struct ServerCommandHandler {
    container: Arc<DependencyContainer>,
    lifecycle: Arc<ApplicationLifecycle>,
}

impl ServerCommandHandler {
    pub fn new(container: Arc<DependencyContainer>, lifecycle: Arc<ApplicationLifecycle>) -> Self {
        Self {
            container,
            lifecycle,
        }
    }

    /// Serve the HTTP API, optionally running a worker and the watchdog in
    /// the same process.
    pub async fn serve(&self, embedded_worker: bool) -> Result<()> {
        let config = &self.container.config;
        let state = AppState {
            coordinator: self.container.coordinator(),
            metrics: config
                .operational
                .enable_metrics
                .then(|| self.container.metrics.clone()),
        };
        let router = create_api_router(
            state,
            Duration::from_secs(config.operational.request_timeout_seconds),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut watchdog = None;
        let worker_handle = if embedded_worker {
            let worker = self.container.worker().await?;
            let mut dog = self.container.watchdog();
            dog.start().await?;
            watchdog = Some(dog);
            Some(tokio::spawn(worker.run(shutdown_rx)))
        } else {
            None
        };

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .with_context(|| format!("Failed to bind port {}", config.http_port))?;
        info!("HTTP server listening on {}", listener.local_addr()?);

        let lifecycle = self.lifecycle.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { lifecycle.wait_for_shutdown().await })
            .await
            .context("HTTP server failed")?;

        let _ = shutdown_tx.send(true);
        if let Some(handle) = worker_handle {
            if let Err(e) = handle.await {
                error!("Embedded worker ended abnormally: {}", e);
            }
        }
        if let Some(mut dog) = watchdog {
            dog.shutdown().await?;
        }
        Ok(())
    }
}

pub struct WorkerCommandHandler {
    container: Arc<DependencyContainer>,
    lifecycle: Arc<ApplicationLifecycle>,
}

impl WorkerCommandHandler {
    pub fn new(container: Arc<DependencyContainer>, lifecycle: Arc<ApplicationLifecycle>) -> Self {
        Self {
            container,
            lifecycle,
        }
    }

    /// Process queued jobs until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        let worker = self.container.worker().await?;
        let mut watchdog = self.container.watchdog();
        watchdog.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        self.lifecycle.wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);

        if let Err(e) = handle.await {
            error!("Worker ended abnormally: {}", e);
        }
        watchdog.shutdown().await
    }
}

pub struct WatchdogCommandHandler {
    container: Arc<DependencyContainer>,
}

impl WatchdogCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// One recovery pass over stuck jobs.
    pub async fn sweep(&self) -> Result<()> {
        let report = self.container.watchdog().sweep().await?;
        info!(
            "Sweep finished: {} expired, {} re-enqueued",
            report.expired.len(),
            report.requeued.len()
        );
        Ok(())
    }
}

/// Drives the polling client against a running server.
pub struct AnalyzeCommandHandler {
    config: Config,
}

impl AnalyzeCommandHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn analyze(&self, scope: AnalysisScope, refresh: bool) -> Result<()> {
        let client = HttpAnalysisClient::new(
            &self.config.client.server_url,
            Duration::from_secs(self.config.client.request_timeout_seconds),
        )?;
        let poller = PollingClient::new(Arc::new(client), self.config.client.polling());

        let mut updates = poller.subscribe();
        let printer = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().clone();
                print_progress(&state);
            }
        });

        let cancel = poller.cancel_handle();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping");
                cancel.cancel();
            }
        });

        let result = if refresh {
            poller.refresh(&scope).await
        } else {
            poller.load(&scope).await
        };
        interrupt.abort();
        drop(poller);
        let _ = printer.await;

        match result {
            Ok(AnalysisState::Ready {
                analysis: Some(text),
                computed_at,
            }) => {
                if let Some(at) = computed_at {
                    println!("Analysis for {scope} (computed {at}):\n");
                }
                println!("{text}");
                Ok(())
            }
            Ok(AnalysisState::Ready { analysis: None, .. }) => {
                println!("No conversations for {scope} yet.");
                Ok(())
            }
            Ok(AnalysisState::Failed { error_message, .. }) => Err(anyhow::anyhow!(
                "Analysis failed: {error_message}. Retry with --refresh"
            )),
            Ok(other) => Err(anyhow::anyhow!("Polling ended in state {other:?}")),
            Err(ClientError::Cancelled) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn print_progress(state: &AnalysisState) {
    match state {
        AnalysisState::Queued { job_id, .. } => info!(%job_id, "Analysis queued"),
        AnalysisState::Running { job_id, .. } => info!(%job_id, "Analysis running"),
        _ => {}
    }
}
