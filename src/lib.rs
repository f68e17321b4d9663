pub mod analysis;
pub mod api;
pub mod application;
pub mod client;
pub mod config;
pub mod database;
pub mod logging;

pub use config::Config;

// Re-export the analysis service surface
pub use analysis::{
    AnalysisError, AnalysisResponse, AnalysisScope, JobStatusResponse, RequestCoordinator,
};

// Re-export the polling client
pub use client::{AnalysisApi, AnalysisState, ClientError, HttpAnalysisClient, PollingClient};
