//! Listing cache with freshness tracking.
//!
//! Each federated server's last good listing is kept with the time it was
//! fetched. Freshness follows a four-step matrix:
//!
//! | age                      | state     |
//! |--------------------------|-----------|
//! | `<= ttl / 2`             | `Fresh`   |
//! | `<= ttl`                 | `Cached`  |
//! | `<= ttl + grace`         | `Stale`   |
//! | beyond                   | `Expired` |
//!
//! Expired listings are withheld from federated views.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Cache freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Recently fetched, within half the TTL.
    Fresh,
    /// Valid but approaching TTL.
    Cached,
    /// Past TTL but within grace period.
    Stale,
    /// Past grace period; must not be served.
    Expired,
}

impl CacheState {
    /// Whether data in this state may be shown.
    pub fn is_servable(&self) -> bool {
        !matches!(self, Self::Expired)
    }

    /// Whether a refresh is overdue.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::Stale | Self::Expired)
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Cached => write!(f, "cached"),
            Self::Stale => write!(f, "stale"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// A cached value with freshness tracking.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
    value: T,
    fetched_at: Instant,
    ttl_ms: u64,
    grace_ms: u64,
}

impl<T> CachedValue<T> {
    pub fn new(value: T, ttl_ms: u64, grace_ms: u64) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
            ttl_ms,
            grace_ms,
        }
    }

    /// Current freshness.
    pub fn state(&self) -> CacheState {
        let age = self.age_ms();
        if age <= self.ttl_ms / 2 {
            CacheState::Fresh
        } else if age <= self.ttl_ms {
            CacheState::Cached
        } else if age <= self.ttl_ms + self.grace_ms {
            CacheState::Stale
        } else {
            CacheState::Expired
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replace the value and restart its age.
    pub fn update(&mut self, value: T) {
        self.value = value;
        self.fetched_at = Instant::now();
    }

    pub fn age_ms(&self) -> u64 {
        self.fetched_at.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn freshness_matrix() {
        let mut cached = CachedValue::new(1u32, 10_000, 30_000);
        assert_eq!(cached.state(), CacheState::Fresh);

        tokio::time::advance(Duration::from_millis(6_000)).await;
        assert_eq!(cached.state(), CacheState::Cached);

        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert_eq!(cached.state(), CacheState::Stale);
        assert!(cached.state().needs_refresh());
        assert!(cached.state().is_servable());

        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert_eq!(cached.state(), CacheState::Expired);
        assert!(!cached.state().is_servable());

        cached.update(2);
        assert_eq!(cached.state(), CacheState::Fresh);
        assert_eq!(*cached.get(), 2);
    }
}
