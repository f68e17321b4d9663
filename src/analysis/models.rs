//! Core data models for cached class and student analyses.
//!
//! An [`AnalysisScope`] names what is analyzed, a [`CacheRecord`] holds the
//! last computed analysis for a scope, and a [`Job`] tracks one computation
//! attempt. The wire responses ([`AnalysisResponse`], [`JobStatusResponse`])
//! are closed tagged enums so callers have to handle every state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::{AnalysisError, Result};

/// What is being analyzed: a whole class or a single student.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisScope {
    /// All students of one class section
    Class {
        institution: String,
        grade: String,
        section: String,
    },
    /// One student
    Student { student_id: String },
}

impl AnalysisScope {
    pub fn class(
        institution: impl Into<String>,
        grade: impl Into<String>,
        section: impl Into<String>,
    ) -> Self {
        AnalysisScope::Class {
            institution: institution.into(),
            grade: grade.into(),
            section: section.into(),
        }
    }

    pub fn student(student_id: impl Into<String>) -> Self {
        AnalysisScope::Student {
            student_id: student_id.into(),
        }
    }

    /// Reject scopes with blank key components.
    pub fn validate(&self) -> Result<()> {
        let blank = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(AnalysisError::InvalidScope(format!("{field} must not be empty")))
            } else {
                Ok(())
            }
        };

        match self {
            AnalysisScope::Class {
                institution,
                grade,
                section,
            } => {
                blank("institution", institution)?;
                blank("grade", grade)?;
                blank("section", section)
            }
            AnalysisScope::Student { student_id } => blank("student_id", student_id),
        }
    }

    /// Canonical, injective key used to index persisted records.
    pub fn cache_key(&self) -> String {
        fn escape(part: &str) -> String {
            part.replace('\\', "\\\\").replace('|', "\\|")
        }

        match self {
            AnalysisScope::Class {
                institution,
                grade,
                section,
            } => format!(
                "class|{}|{}|{}",
                escape(institution),
                escape(grade),
                escape(section)
            ),
            AnalysisScope::Student { student_id } => format!("student|{}", escape(student_id)),
        }
    }
}

impl fmt::Display for AnalysisScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisScope::Class {
                institution,
                grade,
                section,
            } => write!(f, "class {institution}/{grade}/{section}"),
            AnalysisScope::Student { student_id } => write!(f, "student {student_id}"),
        }
    }
}

/// One message of the underlying conversation data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_user: bool,
}

/// Stored freshness flag of a cache record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Ready,
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Ready => "ready",
            CacheStatus::Stale => "stale",
        }
    }
}

impl FromStr for CacheStatus {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(CacheStatus::Ready),
            "stale" => Ok(CacheStatus::Stale),
            other => Err(AnalysisError::Configuration(format!(
                "unknown cache status '{other}'"
            ))),
        }
    }
}

/// Last known analysis for a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub scope: AnalysisScope,
    pub analysis_text: Option<String>,
    pub content_hash: String,
    pub status: CacheStatus,
    pub computed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl CacheRecord {
    /// The stored flag can lag behind the data, so freshness is decided
    /// against the hash of the scope's current messages.
    pub fn is_fresh_for(&self, current_hash: &str) -> bool {
        self.analysis_text.is_some() && self.content_hash == current_hash
    }
}

/// Lifecycle state of a computation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// queued -> running -> {completed | failed}; nothing else.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AnalysisError::Configuration(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// One computation attempt for a scope. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub scope: AnalysisScope,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn queued(scope: AnalysisScope) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            scope,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            error_message: None,
        }
    }
}

/// Outcome of asking the tracker for a new queued job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobCreation {
    Created(Job),
    /// Another request won the race; this is the job already in flight.
    AlreadyInFlight(Job),
}

impl JobCreation {
    pub fn job(&self) -> &Job {
        match self {
            JobCreation::Created(job) | JobCreation::AlreadyInFlight(job) => job,
        }
    }
}

/// Answer to an analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnalysisResponse {
    Ready {
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
    Queued {
        job_id: Uuid,
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
    Running {
        job_id: Uuid,
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
    Failed {
        job_id: Uuid,
        error_message: String,
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
}

impl AnalysisResponse {
    pub fn empty() -> Self {
        AnalysisResponse::Ready {
            analysis: None,
            computed_at: None,
        }
    }

    pub fn from_cache(record: &CacheRecord) -> Self {
        AnalysisResponse::Ready {
            analysis: record.analysis_text.clone(),
            computed_at: record.computed_at,
        }
    }

    /// Describe a job while serving whatever analysis is already cached.
    pub fn for_job(job: &Job, record: Option<&CacheRecord>) -> Self {
        let analysis = record.and_then(|r| r.analysis_text.clone());
        let computed_at = record.and_then(|r| r.computed_at);
        let job_id = job.job_id;

        match job.status {
            JobStatus::Queued => AnalysisResponse::Queued {
                job_id,
                analysis,
                computed_at,
            },
            JobStatus::Running => AnalysisResponse::Running {
                job_id,
                analysis,
                computed_at,
            },
            JobStatus::Completed => AnalysisResponse::Ready {
                analysis,
                computed_at,
            },
            JobStatus::Failed => AnalysisResponse::Failed {
                job_id,
                error_message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "analysis failed".to_string()),
                analysis,
                computed_at,
            },
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            AnalysisResponse::Ready { .. } => None,
            AnalysisResponse::Queued { job_id, .. }
            | AnalysisResponse::Running { job_id, .. }
            | AnalysisResponse::Failed { job_id, .. } => Some(*job_id),
        }
    }

    pub fn analysis(&self) -> Option<&str> {
        match self {
            AnalysisResponse::Ready { analysis, .. }
            | AnalysisResponse::Queued { analysis, .. }
            | AnalysisResponse::Running { analysis, .. }
            | AnalysisResponse::Failed { analysis, .. } => analysis.as_deref(),
        }
    }

    pub fn computed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnalysisResponse::Ready { computed_at, .. }
            | AnalysisResponse::Queued { computed_at, .. }
            | AnalysisResponse::Running { computed_at, .. }
            | AnalysisResponse::Failed { computed_at, .. } => *computed_at,
        }
    }
}

/// Answer to a job status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatusResponse {
    Queued,
    Running,
    Completed {
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
    Failed {
        error_message: String,
    },
}

impl JobStatusResponse {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatusResponse::Completed { .. } | JobStatusResponse::Failed { .. }
        )
    }
}

/// Body of an analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub scope: AnalysisScope,
    #[serde(default)]
    pub force_refresh: bool,
}
