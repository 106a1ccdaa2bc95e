//! BacklogHealthMonitor: advisory snapshot of the candidate backlog

use super::error::ReconcileResult;
use crate::config::HealthLimits;
use crate::storage::CandidateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSeverity {
    Ok,
    Warning,
    /// A hard limit is exceeded
    Critical,
}

/// Derived view; recomputed on every call and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogHealthSnapshot {
    pub pending_count: usize,
    pub oldest_pending_days: Option<i64>,
    pub avg_resolution_hours: Option<f64>,
    pub alerts: Vec<String>,
    pub is_healthy: bool,
    pub severity: HealthSeverity,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BacklogHealthMonitor {
    store: Arc<dyn CandidateStore>,
    limits: HealthLimits,
}

impl BacklogHealthMonitor {
    pub fn new(store: Arc<dyn CandidateStore>, limits: HealthLimits) -> Self {
        Self { store, limits }
    }

    pub fn snapshot(&self, project: &str) -> ReconcileResult<BacklogHealthSnapshot> {
        self.snapshot_at(project, Utc::now())
    }

    pub fn snapshot_at(&self, project: &str, now: DateTime<Utc>) -> ReconcileResult<BacklogHealthSnapshot> {
        let stats = self.store.backlog_stats(project)?;
        let oldest_pending_days = stats.oldest_pending_at.map(|at| (now - at).num_days().max(0));

        let mut breaches = Vec::new();
        if stats.pending_count > self.limits.max_pending {
            breaches.push(format!(
                "{} pending candidates exceed the limit of {}",
                stats.pending_count, self.limits.max_pending
            ));
        }
        if let Some(days) = oldest_pending_days.filter(|d| *d > self.limits.max_oldest_days) {
            breaches.push(format!(
                "oldest pending candidate is {} days old (limit {})",
                days, self.limits.max_oldest_days
            ));
        }

        let severity = if !breaches.is_empty() {
            HealthSeverity::Critical
        } else if !stats.alerts.is_empty() {
            HealthSeverity::Warning
        } else {
            HealthSeverity::Ok
        };

        let mut alerts = breaches;
        alerts.extend(stats.alerts);

        debug!(project, pending = stats.pending_count, severity = ?severity, "backlog health computed");
        Ok(BacklogHealthSnapshot {
            pending_count: stats.pending_count,
            oldest_pending_days,
            avg_resolution_hours: stats.avg_resolution_hours,
            is_healthy: alerts.is_empty(),
            alerts,
            severity,
            computed_at: now,
        })
    }
}
