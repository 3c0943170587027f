use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DownloadError, ErrorKind};
use crate::models::job::JobId;
use crate::models::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Validating,
    CheckingUpdate,
    Downloading,
    Merging,
    Converting,
    Complete,
    Failed,
}

impl JobPhase {
    fn rank(self) -> u8 {
        match self {
            JobPhase::Validating => 0,
            JobPhase::CheckingUpdate => 1,
            JobPhase::Downloading => 2,
            JobPhase::Merging => 3,
            JobPhase::Converting => 4,
            JobPhase::Complete | JobPhase::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Complete | JobPhase::Failed)
    }

    /// Staying in the same phase is allowed so percent updates can repeat;
    /// going back is not. `Failed` is reachable from every active phase.
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobPhase::Failed || next.rank() >= self.rank()
    }

    pub fn default_message(self) -> &'static str {
        match self {
            JobPhase::Validating => "Validating URL...",
            JobPhase::CheckingUpdate => "Checking for extractor updates...",
            JobPhase::Downloading => "Downloading video...",
            JobPhase::Merging => "Merging video and audio...",
            JobPhase::Converting => "Converting video...",
            JobPhase::Complete => "Complete!",
            JobPhase::Failed => "Failed",
        }
    }
}

/// One entry on a job's progress channel.
///
/// For a given job the channel carries status events in phase order and is
/// closed by exactly one `Complete` or `Error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        job_id: JobId,
        phase: JobPhase,
        message: String,
        percent: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    Complete {
        job_id: JobId,
        download_id: Uuid,
        platform: Platform,
        filename: String,
        size_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    Error {
        job_id: JobId,
        kind: ErrorKind,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn status(job_id: JobId, phase: JobPhase, message: impl Into<String>, percent: Option<f64>) -> Self {
        ProgressEvent::Status {
            job_id,
            phase,
            message: message.into(),
            percent,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(job_id: JobId, err: &DownloadError) -> Self {
        ProgressEvent::Error {
            job_id,
            kind: err.kind(),
            error: err.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            ProgressEvent::Status { job_id, .. }
            | ProgressEvent::Complete { job_id, .. }
            | ProgressEvent::Error { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Status { .. })
    }

    /// Event name on the push stream.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Status { .. } => "status",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }
}
