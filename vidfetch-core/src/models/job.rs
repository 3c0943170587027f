use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::Artifact;
use crate::core::events::JobPhase;
use crate::core::url_cleaner::CanonicalUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: JobId,
    pub url: CanonicalUrl,
    pub phase: JobPhase,
    pub failure: Option<String>,
    pub artifact: Option<Artifact>,
}

impl DownloadJob {
    pub fn new(url: CanonicalUrl) -> Self {
        Self {
            id: JobId::new(),
            url,
            phase: JobPhase::Validating,
            failure: None,
            artifact: None,
        }
    }

    /// Moves the job forward. Returns `false` when `phase` would revisit an
    /// earlier phase or the job is already terminal.
    pub fn advance(&mut self, phase: JobPhase) -> bool {
        if !self.phase.can_advance_to(phase) {
            return false;
        }
        self.phase = phase;
        true
    }
}
