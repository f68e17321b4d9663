//! Read access to the host application's conversation data.
//!
//! The analysis service never writes conversations; it only needs the
//! ordered message set of a scope to fingerprint it and to build the
//! transcript handed to the generator.
//!
//! [`PgConversationStore`] reads the host schema:
//! - `students(id, institution, grade, section)`
//! - `conversations(id, student_id)`
//! - `messages(id, conversation_id, content, is_user, created_at)`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

use super::models::{AnalysisScope, ConversationMessage};

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Conversation store unavailable: {0}")]
    Unavailable(String),
    #[error("Conversation query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Messages belonging to `scope`, ordered by timestamp.
    async fn get_messages(
        &self,
        scope: &AnalysisScope,
    ) -> Result<Vec<ConversationMessage>, ConversationError>;
}

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn get_messages(
        &self,
        scope: &AnalysisScope,
    ) -> Result<Vec<ConversationMessage>, ConversationError> {
        let rows = match scope {
            AnalysisScope::Class {
                institution,
                grade,
                section,
            } => {
                sqlx::query(
                    r#"
                    SELECT m.id::text AS id, m.content, m.is_user, m.created_at
                    FROM messages m
                    JOIN conversations c ON c.id = m.conversation_id
                    JOIN students s ON s.id = c.student_id
                    WHERE s.institution = $1 AND s.grade = $2 AND s.section = $3
                    ORDER BY m.created_at, m.id
                    "#,
                )
                .bind(institution)
                .bind(grade)
                .bind(section)
                .fetch_all(&self.pool)
                .await
            }
            AnalysisScope::Student { student_id } => {
                sqlx::query(
                    r#"
                    SELECT m.id::text AS id, m.content, m.is_user, m.created_at
                    FROM messages m
                    JOIN conversations c ON c.id = m.conversation_id
                    WHERE c.student_id::text = $1
                    ORDER BY m.created_at, m.id
                    "#,
                )
                .bind(student_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| ConversationError::Unavailable(e.to_string()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp: DateTime<Utc> = row.try_get("created_at")?;
            messages.push(ConversationMessage {
                id: row.try_get("id")?,
                content: row.try_get("content")?,
                timestamp,
                is_user: row.try_get("is_user")?,
            });
        }

        debug!("Loaded {} messages for {}", messages.len(), scope);
        Ok(messages)
    }
}
