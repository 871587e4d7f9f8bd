// Stored cache entry layout

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A cached value with an optional absolute expiry
///
/// Serialized as `{"data": <value>, "expired": <epoch millis>}`; a missing
/// `expired` field means the entry never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired: Option<i64>,
}

impl<T> CacheEntry<T> {
    /// Build an entry that expires `ttl_minutes` after `now`
    ///
    /// A TTL past the representable time range is stored without an expiry.
    pub fn new(data: T, ttl_minutes: Option<u64>, now: DateTime<Utc>) -> Self {
        let expired = ttl_minutes
            .filter(|ttl| *ttl > 0)
            .and_then(|ttl| expiry_after(now, ttl));

        Self { data, expired }
    }

    /// An entry is expired once `now` reaches its expiry timestamp
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expired {
            None => false,
            Some(expired) => now.timestamp_millis() >= expired,
        }
    }

    /// Expiry as a timestamp, if any
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expired
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

fn expiry_after(now: DateTime<Utc>, ttl_minutes: u64) -> Option<i64> {
    let minutes = i64::try_from(ttl_minutes).ok()?;
    let ttl = Duration::try_minutes(minutes)?;
    now.checked_add_signed(ttl).map(|at| at.timestamp_millis())
}
