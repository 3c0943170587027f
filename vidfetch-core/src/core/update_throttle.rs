use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateState {
    pub last_checked_at: Option<DateTime<Utc>>,
    pub check_interval: Duration,
}

/// Decides when the extractor is due for a refresh.
///
/// `should_refresh` is a check-and-set: the caller that sees `true` owns the
/// current window and every other caller sees `false` until it elapses.
#[derive(Debug)]
pub struct UpdateThrottle {
    state: Mutex<UpdateState>,
}

impl UpdateThrottle {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            state: Mutex::new(UpdateState {
                last_checked_at: None,
                check_interval,
            }),
        }
    }

    pub async fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let due = match state.last_checked_at {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= state.check_interval)
                .unwrap_or(false),
        };
        if due {
            state.last_checked_at = Some(now);
        }
        due
    }

    /// Restarts the window after a refresh attempt, whatever its outcome.
    pub async fn mark_refreshed(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.last_checked_at = Some(now);
    }

    pub async fn snapshot(&self) -> UpdateState {
        *self.state.lock().await
    }
}
