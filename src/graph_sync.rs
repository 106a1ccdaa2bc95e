//! External graph synchronization: the submit-then-poll job contract
//!
//! Promotion hands promoted codes to the graph database as an asynchronous
//! job: `submit()` returns a task id, `status()` is polled until the job
//! completes or fails. The engine never owns the synchronization logic; it
//! only passes the counts through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Identifier of a remote job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote status of a polled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum JobStatus<T> {
    Pending,
    Completed(T),
    Failed(String),
}

/// Counts reported by the graph after a sync job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSyncReport {
    pub synced_codes: usize,
    pub synced_relations: usize,
    /// Code nodes created or merged in the graph
    #[serde(rename = "neo4j_merged")]
    pub merged: usize,
    /// Evidence fragments the graph could not find
    #[serde(rename = "neo4j_missing_fragments")]
    pub missing_fragments: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphSyncError {
    #[error("graph sync not available: {0}")]
    Unavailable(String),
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
}

/// Client trait for the graph synchronization target.
#[async_trait]
pub trait GraphSync: Send + Sync {
    /// Submit codes for synchronization. An empty list means the whole codebook.
    async fn submit(&self, project: &str, codes: &[String]) -> Result<TaskId, GraphSyncError>;

    async fn status(&self, task: &TaskId) -> Result<JobStatus<GraphSyncReport>, GraphSyncError>;
}

/// Graph sync for deployments without a graph database. Completes at once
/// with an empty report.
#[derive(Debug, Default, Clone)]
pub struct DisabledGraphSync;

#[async_trait]
impl GraphSync for DisabledGraphSync {
    async fn submit(&self, project: &str, codes: &[String]) -> Result<TaskId, GraphSyncError> {
        tracing::debug!(project, codes = codes.len(), "graph sync disabled; nothing submitted");
        Ok(TaskId::new("disabled"))
    }

    async fn status(&self, _task: &TaskId) -> Result<JobStatus<GraphSyncReport>, GraphSyncError> {
        Ok(JobStatus::Completed(GraphSyncReport::default()))
    }
}

/// Scripted graph sync for testing.
///
/// Reports `Pending` for a configured number of polls, then the configured
/// final status. Records every submission.
pub struct MockGraphSync {
    pending_polls: u32,
    outcome: Option<JobStatus<GraphSyncReport>>,
    available: bool,
    /// Leading status requests that fail before any answer
    status_errors: u32,
    polls: AtomicU32,
    submissions: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockGraphSync {
    /// Completes with `report` after `pending_polls` pending answers.
    pub fn completing(report: GraphSyncReport, pending_polls: u32) -> Self {
        Self {
            pending_polls,
            outcome: Some(JobStatus::Completed(report)),
            available: true,
            status_errors: 0,
            polls: AtomicU32::new(0),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Fails with `message` after `pending_polls` pending answers.
    pub fn failing(message: impl Into<String>, pending_polls: u32) -> Self {
        Self {
            outcome: Some(JobStatus::Failed(message.into())),
            ..Self::completing(GraphSyncReport::default(), pending_polls)
        }
    }

    /// Never leaves `Pending`.
    pub fn stuck() -> Self {
        Self {
            outcome: None,
            ..Self::completing(GraphSyncReport::default(), 0)
        }
    }

    /// Rejects every submission.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::completing(GraphSyncReport::default(), 0)
        }
    }

    /// Fail the first `n` status requests as if the service dropped them.
    pub fn with_status_errors(mut self, n: u32) -> Self {
        self.status_errors = n;
        self
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<(String, Vec<String>)> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphSync for MockGraphSync {
    async fn submit(&self, project: &str, codes: &[String]) -> Result<TaskId, GraphSyncError> {
        if !self.available {
            return Err(GraphSyncError::Unavailable(
                "mock graph sync configured as unavailable".to_string(),
            ));
        }
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((project.to_string(), codes.to_vec()));
        Ok(TaskId::new(format!("mock-task-{}", submissions.len())))
    }

    async fn status(&self, _task: &TaskId) -> Result<JobStatus<GraphSyncReport>, GraphSyncError> {
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        if seen < self.status_errors {
            return Err(GraphSyncError::Unavailable(format!("status request {} dropped", seen + 1)));
        }
        match &self.outcome {
            Some(outcome) if seen >= self.pending_polls => Ok(outcome.clone()),
            _ => Ok(JobStatus::Pending),
        }
    }
}
