//! Durable timer type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// "Wake workflow `workflow_id` at `fire_at`."
///
/// Owned by the timer scheduler; persisted by the store so that pending
/// waits survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    /// UUIDv7 timer ID.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Absolute fire time.
    pub fire_at: DateTime<Utc>,
    /// Requested wait in seconds, kept for the `TimerFired` payload.
    pub duration_secs: i64,
    pub created_at: DateTime<Utc>,
}

impl Timer {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}
