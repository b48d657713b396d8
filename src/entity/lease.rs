//! Lease - time-bounded exclusivity on an entity
//!
//! A lease is owned by the store, never by the entity payload: `upsert`
//! keeps whatever lease is on record. Expiry is purely time-based, so a
//! crashed worker's claim heals itself once `expires_at` passes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::duration_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl Lease {
    pub fn new(holder: impl Into<String>, now: i64, duration: Duration) -> Self {
        Self {
            holder: holder.into(),
            acquired_at: now,
            expires_at: now.saturating_add(duration_millis(duration)),
        }
    }

    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    #[inline]
    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }

    /// Whether `holder` may take (or extend) this lease at `now`
    #[inline]
    pub fn admits(&self, holder: &str, now: i64) -> bool {
        self.is_expired(now) || self.is_held_by(holder)
    }

    /// Live and owned by someone other than `holder`
    #[inline]
    pub fn blocks(&self, holder: &str, now: i64) -> bool {
        !self.admits(holder, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let lease = Lease::new("worker-a", 1_000, Duration::from_millis(500));
        assert_eq!(lease.expires_at, 1_500);
        assert!(!lease.is_expired(1_499));
        assert!(lease.is_expired(1_500));
    }

    #[test]
    fn test_lease_admits_holder_and_expired() {
        let lease = Lease::new("worker-a", 0, Duration::from_secs(1));

        assert!(lease.admits("worker-a", 10));
        assert!(!lease.admits("worker-b", 10));
        assert!(lease.blocks("worker-b", 10));

        // after expiry anyone may take it
        assert!(lease.admits("worker-b", 1_000));
    }
}
