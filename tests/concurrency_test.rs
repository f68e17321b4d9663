//! Concurrent requests and workers against shared in-memory stores.

mod helpers;

use classroom_insights::analysis::{
    AnalysisResponse, AnalysisScope, CacheStore, JobOutcome, JobStatus, WorkerConfig,
};
use helpers::fakes::{Harness, ScriptedGenerator};
use helpers::message;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_job() {
    let h = Arc::new(Harness::new());
    let scope = AnalysisScope::class("north-high", "10", "A");
    h.conversations
        .set_messages(&scope, vec![message("m1", "What is a mole?", 0)])
        .await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let h = h.clone();
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            h.coordinator
                .request_analysis(&scope, i % 3 == 0)
                .await
                .unwrap()
        }));
    }

    let mut job_ids = HashSet::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert!(matches!(response, AnalysisResponse::Queued { .. }));
        job_ids.insert(response.job_id().unwrap());
    }

    assert_eq!(job_ids.len(), 1);
    assert_eq!(h.jobs.all_jobs().await.len(), 1);
    assert_eq!(h.queue.len().await, 1);

    assert_eq!(h.drain().await, vec![JobOutcome::Completed]);
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_and_refreshes_never_overlap_jobs_for_a_scope() {
    let h = Arc::new(Harness::with_generator(
        ScriptedGenerator::new(),
        WorkerConfig {
            concurrency: 4,
            idle_poll_interval_ms: 5,
            ..WorkerConfig::default()
        },
    ));
    h.generator.set_delay(Duration::from_millis(15)).await;

    let scopes = vec![
        AnalysisScope::class("north-high", "10", "A"),
        AnalysisScope::class("north-high", "10", "B"),
        AnalysisScope::student("s-7"),
    ];
    for (i, scope) in scopes.iter().enumerate() {
        h.conversations
            .set_messages(scope, vec![message(&format!("m{i}"), "question", 0)])
            .await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(h.worker.clone().run(shutdown_rx));

    // Sample the at-most-one-in-flight rule while traffic runs
    let stop_sampling = Arc::new(AtomicBool::new(false));
    let sampler = {
        let h = h.clone();
        let scopes = scopes.clone();
        let stop = stop_sampling.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                for scope in &scopes {
                    let in_flight = h
                        .jobs
                        .jobs_for(scope)
                        .await
                        .iter()
                        .filter(|job| job.status.is_in_flight())
                        .count();
                    assert!(in_flight <= 1, "{in_flight} jobs in flight for {scope}");
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let mut requests = Vec::new();
    for round in 0..10 {
        for scope in &scopes {
            let h = h.clone();
            let scope = scope.clone();
            requests.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(round * 7)).await;
                h.coordinator.request_analysis(&scope, true).await.unwrap()
            }));
        }
    }
    for request in requests {
        request.await.unwrap();
    }

    wait_until(|| {
        let h = h.clone();
        async move {
            h.jobs
                .all_jobs()
                .await
                .iter()
                .all(|job| !job.status.is_in_flight())
        }
    })
    .await;

    stop_sampling.store(true, Ordering::SeqCst);
    sampler.await.unwrap();
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();

    // Every job ended, and each scope has exactly one cache record
    for job in h.jobs.all_jobs().await {
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert_eq!(h.cache.len().await, scopes.len());
    for scope in &scopes {
        let record = h.cache.get(scope).await.unwrap().unwrap();
        assert!(record.analysis_text.is_some());
    }
    assert_eq!(h.generator.calls(), h.jobs.all_jobs().await.len());
}

#[tokio::test]
async fn test_worker_drains_in_flight_job_on_shutdown() {
    let h = Harness::with_generator(
        ScriptedGenerator::gated(),
        WorkerConfig {
            idle_poll_interval_ms: 5,
            ..WorkerConfig::default()
        },
    );
    let scope = AnalysisScope::student("s-9");
    h.conversations
        .set_messages(&scope, vec![message("m1", "hello", 0)])
        .await;
    let job_id = h
        .coordinator
        .request_analysis(&scope, false)
        .await
        .unwrap()
        .job_id()
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(h.worker.clone().run(shutdown_rx));

    let generator = &h.generator;
    wait_until(|| async move { generator.calls() == 1 }).await;
    shutdown_tx.send(true).unwrap();

    // Still waiting on the generator
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!worker.is_finished());

    h.generator.release(1);
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();

    let job = h
        .jobs
        .all_jobs()
        .await
        .into_iter()
        .find(|job| job.job_id == job_id)
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_worker_leaves_queue_untouched_after_shutdown() {
    let h = Harness::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(true);
    drop(shutdown_tx);

    tokio::time::timeout(Duration::from_secs(1), h.worker.clone().run(shutdown_rx))
        .await
        .expect("worker did not stop");

    let scope = AnalysisScope::student("late");
    h.conversations
        .set_messages(&scope, vec![message("m1", "hi", 0)])
        .await;
    h.coordinator.request_analysis(&scope, false).await.unwrap();
    assert_eq!(h.queue.len().await, 1);
}
