use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::platform::Platform;

/// A finished download held by the file store.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub id: Uuid,
    #[serde(skip)]
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub platform: Platform,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub first_read_at: Option<DateTime<Utc>>,
}

impl Artifact {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
