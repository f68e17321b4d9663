use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics for the analysis pipeline
pub struct AnalysisMetrics {
    registry: Arc<Registry>,

    // Coordinator metrics
    pub requests_total: IntCounter,
    pub cache_hits_total: IntCounter,
    pub jobs_enqueued_total: IntCounter,

    // Worker metrics
    pub jobs_completed_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub jobs_skipped_total: IntCounter,
    pub generation_duration_seconds: Histogram,

    // Watchdog metrics
    pub jobs_expired_total: IntCounter,
    pub jobs_requeued_total: IntCounter,
}

impl AnalysisMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requests_total = counter(
            "analysis_requests_total",
            "Total number of analysis requests",
        )?;
        let cache_hits_total = counter(
            "analysis_cache_hits_total",
            "Analysis requests answered from a fresh cache record",
        )?;
        let jobs_enqueued_total = counter(
            "analysis_jobs_enqueued_total",
            "Analysis jobs created and enqueued",
        )?;
        let jobs_completed_total = counter(
            "analysis_jobs_completed_total",
            "Analysis jobs that completed",
        )?;
        let jobs_failed_total = counter(
            "analysis_jobs_failed_total",
            "Analysis jobs that failed in the worker",
        )?;
        let jobs_skipped_total = counter(
            "analysis_jobs_skipped_total",
            "Duplicate job deliveries ignored by the worker",
        )?;
        let jobs_expired_total = counter(
            "analysis_jobs_expired_total",
            "Running jobs failed by the watchdog",
        )?;
        let jobs_requeued_total = counter(
            "analysis_jobs_requeued_total",
            "Queued jobs re-dispatched by the watchdog",
        )?;

        let generation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "analysis_generation_duration_seconds",
                "Duration of generator calls in seconds",
            )
            .buckets(exponential_buckets(0.5, 2.0, 10)?),
        )?;
        registry.register(Box::new(generation_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            cache_hits_total,
            jobs_enqueued_total,
            jobs_completed_total,
            jobs_failed_total,
            jobs_skipped_total,
            generation_duration_seconds,
            jobs_expired_total,
            jobs_requeued_total,
        })
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_counters() {
        let metrics = AnalysisMetrics::new().unwrap();
        metrics.requests_total.inc();
        metrics.jobs_failed_total.inc_by(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("analysis_requests_total 1"));
        assert!(text.contains("analysis_jobs_failed_total 2"));
        assert!(text.contains("analysis_generation_duration_seconds"));
    }
}
