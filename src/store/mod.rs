// Credential store
// TTL-aware key/value cache holding the session credentials

mod backend;
mod clock;
mod entry;

pub use backend::{MemoryStorage, SqliteStorage, StorageBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::CacheEntry;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::CredentialRecord;

/// Key of the cached access token
pub const ACCESS_TOKEN_KEY: &str = "token";

/// Key of the cached refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Key of the session user id (never expires)
pub const USER_ID_KEY: &str = "user_id";

/// Default access token lifetime: one hour
pub const DEFAULT_ACCESS_TTL_MINUTES: u64 = 60;

/// Default refresh token lifetime: one week
pub const DEFAULT_REFRESH_TTL_MINUTES: u64 = 7 * 24 * 60;

/// Result of a cache read
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// Absent, expired or unreadable
    Miss,
    /// Storage medium cannot be used
    Unavailable,
}

impl<T> Lookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Lookup::Unavailable)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Hit(value) => Lookup::Hit(f(value)),
            Lookup::Miss => Lookup::Miss,
            Lookup::Unavailable => Lookup::Unavailable,
        }
    }
}

/// Result of a cache mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Applied,
    /// Nothing to act on (update of a missing key)
    Absent,
    Unavailable,
}

/// Lifetimes applied when writing tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTtl {
    pub access_minutes: u64,
    pub refresh_minutes: u64,
}

impl Default for TokenTtl {
    fn default() -> Self {
        Self {
            access_minutes: DEFAULT_ACCESS_TTL_MINUTES,
            refresh_minutes: DEFAULT_REFRESH_TTL_MINUTES,
        }
    }
}

/// TTL cache over a [`StorageBackend`]
///
/// Expiry is lazy: an expired entry is evicted by the read that discovers it.
/// No operation fails; an unusable medium turns every call into a logged no-op.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    ttl: TokenTtl,
}

impl CredentialStore {
    /// Create a store using the wall clock and default token lifetimes
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    /// Create a store with an explicit time source
    pub fn with_clock(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            ttl: TokenTtl::default(),
        }
    }

    /// Override token lifetimes
    pub fn with_ttl(mut self, ttl: TokenTtl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> TokenTtl {
        self.ttl
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Read a live value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        self.read_entry::<T>(key).map(|entry| entry.data)
    }

    /// Expiry of a live entry (`None` inside the hit means it never expires)
    pub fn expiry_of(&self, key: &str) -> Lookup<Option<DateTime<Utc>>> {
        self.read_entry::<serde_json::Value>(key)
            .map(|entry| entry.expires_at())
    }

    /// Store `value`, expiring after `ttl_minutes` when given
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl_minutes: Option<u64>) -> StoreStatus {
        if !self.check_available("set", key) {
            return StoreStatus::Unavailable;
        }

        let entry = CacheEntry::new(value, ttl_minutes, self.clock.now());
        match serde_json::to_string(&entry) {
            Ok(raw) => self.write_raw(key, &raw),
            Err(e) => {
                tracing::error!(key = key, error = %e, "Failed to serialize cache entry");
                StoreStatus::Absent
            }
        }
    }

    /// Replace the value of an existing entry, keeping its expiry
    pub fn update<T: Serialize>(&self, key: &str, value: &T) -> StoreStatus {
        if !self.check_available("update", key) {
            return StoreStatus::Unavailable;
        }

        let raw = match self.backend.read(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return StoreStatus::Absent,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to read cache entry for update");
                return StoreStatus::Unavailable;
            }
        };

        let mut entry: CacheEntry<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Dropping corrupt cache entry");
                self.remove(key);
                return StoreStatus::Absent;
            }
        };

        entry.data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(key = key, error = %e, "Failed to serialize cache value");
                return StoreStatus::Absent;
            }
        };

        match serde_json::to_string(&entry) {
            Ok(raw) => self.write_raw(key, &raw),
            Err(e) => {
                tracing::error!(key = key, error = %e, "Failed to serialize cache entry");
                StoreStatus::Absent
            }
        }
    }

    /// Delete an entry; removing a missing key is fine
    pub fn remove(&self, key: &str) -> StoreStatus {
        if !self.check_available("remove", key) {
            return StoreStatus::Unavailable;
        }

        match self.backend.delete(key) {
            Ok(()) => StoreStatus::Applied,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to remove cache entry");
                StoreStatus::Unavailable
            }
        }
    }

    pub fn access_token(&self) -> Lookup<String> {
        self.get(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Lookup<String> {
        self.get(REFRESH_TOKEN_KEY)
    }

    pub fn user_id(&self) -> Lookup<String> {
        self.get(USER_ID_KEY)
    }

    pub fn save_access_token(&self, token: &str) -> StoreStatus {
        self.set(ACCESS_TOKEN_KEY, &token, Some(self.ttl.access_minutes))
    }

    pub fn save_refresh_token(&self, token: &str) -> StoreStatus {
        self.set(REFRESH_TOKEN_KEY, &token, Some(self.ttl.refresh_minutes))
    }

    pub fn save_user_id(&self, user_id: &str) -> StoreStatus {
        self.set(USER_ID_KEY, &user_id, None)
    }

    /// Persist a freshly issued credential set (login)
    pub fn store_session(&self, record: &CredentialRecord) -> StoreStatus {
        let status = self.save_access_token(&record.access_token);
        if status == StoreStatus::Unavailable {
            return status;
        }
        self.save_refresh_token(&record.refresh_token);
        if let Some(ref user_id) = record.user_id {
            self.save_user_id(user_id);
        }
        status
    }

    /// Snapshot of the live credentials, if both tokens are cached
    pub fn credentials(&self) -> Option<CredentialRecord> {
        let access_token = self.access_token().hit()?;
        let refresh_token = self.refresh_token().hit()?;
        Some(CredentialRecord {
            access_token,
            refresh_token,
            user_id: self.user_id().hit(),
        })
    }

    /// Drop every session credential (logout or session invalidation)
    pub fn clear_session(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY] {
            self.remove(key);
        }
        tracing::debug!("Session credentials cleared");
    }

    fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Lookup<CacheEntry<T>> {
        if !self.check_available("get", key) {
            return Lookup::Unavailable;
        }

        let raw = match self.backend.read(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to read cache entry");
                return Lookup::Unavailable;
            }
        };

        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) if entry.is_expired(self.clock.now()) => {
                tracing::debug!(key = key, "Cache entry expired, evicting");
                self.remove(key);
                Lookup::Miss
            }
            Ok(entry) => Lookup::Hit(entry),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Dropping corrupt cache entry");
                self.remove(key);
                Lookup::Miss
            }
        }
    }

    fn write_raw(&self, key: &str, raw: &str) -> StoreStatus {
        match self.backend.write(key, raw) {
            Ok(()) => StoreStatus::Applied,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to write cache entry");
                StoreStatus::Unavailable
            }
        }
    }

    fn check_available(&self, op: &str, key: &str) -> bool {
        let available = self.backend.is_available();
        if !available {
            tracing::warn!(op = op, key = key, "Credential storage is not available");
        }
        available
    }
}
