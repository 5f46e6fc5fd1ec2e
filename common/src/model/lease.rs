use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time-bounded exclusive claim on a named resource. At most one owner per
/// name may hold an unexpired lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub acquired_until: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.acquired_until
    }
}
