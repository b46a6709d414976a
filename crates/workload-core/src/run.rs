use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
    SkippedOverlap,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::SkippedOverlap => "skipped_overlap",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(RunStatus::Completed),
            "cancelled" => Some(RunStatus::Cancelled),
            "failed" => Some(RunStatus::Failed),
            "skipped_overlap" => Some(RunStatus::SkippedOverlap),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one reconciliation pass, persisted as a run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub products_processed: usize,
    pub products_deactivated: usize,
    pub opportunities_seen: usize,
    pub opportunities_reconciled: usize,
    pub opportunities_failed: usize,
    pub opportunities_deactivated: usize,
    pub records_rejected: usize,
}

impl RunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Completed,
            started_at,
            finished_at: started_at,
            products_processed: 0,
            products_deactivated: 0,
            opportunities_seen: 0,
            opportunities_reconciled: 0,
            opportunities_failed: 0,
            opportunities_deactivated: 0,
            records_rejected: 0,
        }
    }

    /// Stale sweeps only follow a pass that ran to the end.
    pub fn allows_sweep(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
