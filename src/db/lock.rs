//! Per-key single-writer leases on top of the `row_locks` table.
//!
//! A lease is taken with one atomic upsert that only succeeds when the key is
//! free or its previous holder's TTL has run out, so a crashed writer never
//! wedges a key. Only the key being written is locked; unrelated events and
//! sports proceed in parallel.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use super::Database;
use crate::error::{CoreError, Result};

/// Bounded exponential backoff for contended keys
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a lease survives without being released
    pub lease_ttl: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(250),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), with up to 50% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let jitter_ms = exp.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        exp + Duration::from_millis(jitter)
    }
}

/// A held lease. Released on drop.
pub struct RowLock {
    db: Database,
    key: String,
    owner: String,
    released: bool,
}

impl RowLock {
    /// Single attempt. Busy → `ConcurrencyConflict`.
    pub fn attempt(db: &Database, key: &str, ttl: Duration) -> Result<RowLock> {
        let owner = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        if db.try_acquire_lock(key, &owner, ttl)? {
            Ok(RowLock {
                db: db.clone(),
                key: key.to_string(),
                owner,
                released: false,
            })
        } else {
            Err(CoreError::ConcurrencyConflict {
                key: key.to_string(),
            })
        }
    }

    /// Single attempt that reports a busy key as `None` instead of an error.
    pub fn try_acquire(db: &Database, key: &str, ttl: Duration) -> Result<Option<RowLock>> {
        match Self::attempt(db, key, ttl) {
            Ok(lock) => Ok(Some(lock)),
            Err(CoreError::ConcurrencyConflict { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Retry contended keys with backoff; surface `Transient` when out of attempts.
    pub fn acquire(db: &Database, key: &str, policy: &RetryPolicy) -> Result<RowLock> {
        let attempts = policy.max_attempts.max(1);
        for attempt in 0..attempts {
            match Self::attempt(db, key, policy.lease_ttl) {
                Ok(lock) => return Ok(lock),
                Err(e) if e.is_retryable() => {
                    debug!("Lock {} busy (attempt {}/{})", key, attempt + 1, attempts);
                    if attempt + 1 < attempts {
                        std::thread::sleep(policy.backoff(attempt));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Transient {
            key: key.to_string(),
            attempts,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.db.release_lock(&self.key, &self.owner)?;
        Ok(())
    }
}

impl Drop for RowLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.db.release_lock(&self.key, &self.owner) {
            warn!("Failed to release lock {}: {}", self.key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            lease_ttl: Duration::from_secs(30),
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(1),
        };
        let first = policy.backoff(0);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        let late = policy.backoff(8);
        assert!(late >= Duration::from_millis(100) && late <= Duration::from_millis(150));
    }

    #[test]
    fn drop_releases_the_lease() {
        let db = Database::open_in_memory().unwrap();
        {
            let _held = RowLock::acquire(&db, "odds:e1", &fast_policy(1)).unwrap();
            assert!(RowLock::try_acquire(&db, "odds:e1", Duration::from_secs(5))
                .unwrap()
                .is_none());
        }
        assert!(RowLock::try_acquire(&db, "odds:e1", Duration::from_secs(5))
            .unwrap()
            .is_some());
    }

    #[test]
    fn contention_surfaces_as_transient_after_retries() {
        let db = Database::open_in_memory().unwrap();
        let _held = RowLock::acquire(&db, "weights:nfl", &fast_policy(1)).unwrap();
        match RowLock::acquire(&db, "weights:nfl", &fast_policy(3)) {
            Err(CoreError::Transient { key, attempts }) => {
                assert_eq!(key, "weights:nfl");
                assert_eq!(attempts, 3);
            }
            Err(other) => panic!("Expected Transient, got {:?}", other),
            Ok(_) => panic!("Expected Transient, got a lock"),
        }
    }

    #[test]
    fn explicit_release_frees_key() {
        let db = Database::open_in_memory().unwrap();
        let lock = RowLock::acquire(&db, "cycle:nba", &fast_policy(1)).unwrap();
        assert_eq!(lock.key(), "cycle:nba");
        lock.release().unwrap();
        assert!(RowLock::attempt(&db, "cycle:nba", Duration::from_secs(5)).is_ok());
    }
}
