//! Shared fixtures for integration tests.
#![allow(dead_code)]

pub mod fakes;
pub mod ollama_mock;

use chrono::{DateTime, Duration, TimeZone, Utc};
use classroom_insights::analysis::ConversationMessage;

/// A message `minutes` after a fixed base time, so hashes are reproducible.
pub fn message(id: &str, content: &str, minutes: i64) -> ConversationMessage {
    ConversationMessage {
        id: id.to_string(),
        content: content.to_string(),
        timestamp: base_time() + Duration::minutes(minutes),
        is_user: minutes % 2 == 0,
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap()
}
