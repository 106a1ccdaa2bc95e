//! Fire-and-poll observation of remote jobs
//!
//! A caller submits work, gets a task id, and polls at a fixed interval up to
//! a bounded number of attempts. Giving up (timeout or cancellation) only
//! stops the polling; the remote job is never aborted and nothing it already
//! committed is rolled back.

use crate::config::PollConfig;
use crate::graph_sync::JobStatus;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A cooperative cancellation token.
///
/// The view that started a poll sets the token (e.g. when it closes); the
/// poller checks it before each status request.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a polled job ended up from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Completed(T),
    Failed(String),
    TimedOut { attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Polls a status source until it settles or attempts run out.
#[derive(Debug, Clone)]
pub struct JobPoller {
    interval: Duration,
    max_attempts: u32,
    token: CancellationToken,
}

impl JobPoller {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            interval: config.interval(),
            max_attempts: config.max_attempts.max(1),
            token: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Poll `check` until the job completes, fails, the attempts run out,
    /// or the token is cancelled. `job` names the work in log output.
    ///
    /// Only a `Failed` status settles the job as failed. An error from
    /// `check` itself counts as one attempt; if the last attempt errored the
    /// poll ends `Failed` with that error instead of `TimedOut`.
    pub async fn wait<T, E, F, Fut>(&self, job: &str, mut check: F) -> PollState<T>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobStatus<T>, E>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            if self.token.is_cancelled() {
                debug!(job, attempt, "polling cancelled; remote job left running");
                return PollState::Cancelled {
                    attempts: attempt - 1,
                };
            }

            match check().await {
                Ok(JobStatus::Completed(value)) => return PollState::Completed(value),
                Ok(JobStatus::Failed(msg)) => return PollState::Failed(msg),
                Ok(JobStatus::Pending) => last_error = None,
                Err(e) => {
                    debug!(job, attempt, error = %e, "status request failed; retrying");
                    last_error = Some(e.to_string());
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        if let Some(error) = last_error {
            warn!(job, attempts = self.max_attempts, %error, "status unreachable; remote job left running");
            return PollState::Failed(error);
        }

        warn!(
            job,
            attempts = self.max_attempts,
            "gave up polling; remote job left running"
        );
        PollState::TimedOut {
            attempts: self.max_attempts,
        }
    }
}
