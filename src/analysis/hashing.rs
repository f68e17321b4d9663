//! Content fingerprint of a scope's conversation data.

use chrono::SecondsFormat;
use sha2::{Digest, Sha256};

use super::models::ConversationMessage;

const FIELD_SEPARATOR: u8 = 0x1f;
const RECORD_SEPARATOR: u8 = 0x1e;

/// SHA-256 over id, timestamp and content of every message, hex encoded.
///
/// Messages are hashed in `(timestamp, id)` order so the digest does not
/// depend on the order the collaborator returned them in. Adding, editing or
/// removing any message changes the digest.
pub fn content_hash(messages: &[ConversationMessage]) -> String {
    let mut ordered: Vec<&ConversationMessage> = messages.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let mut hasher = Sha256::new();
    for message in ordered {
        hasher.update(message.id.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(
            message
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(message.content.as_bytes());
        hasher.update([RECORD_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}
