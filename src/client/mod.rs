//! Caller side of the request/poll protocol.

pub mod poller;
pub mod retry;
pub mod transport;

pub use poller::{AnalysisState, CancelHandle, PollingClient, PollingConfig};
pub use retry::{RetryConfig, RetryPolicy};
pub use transport::{AnalysisApi, ClientError, HttpAnalysisClient};
