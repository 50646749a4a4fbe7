//! Fixed-window request counting per client.
//!
//! Each client key gets a counter that resets when its window ends. This is deliberately the
//! simple approximate scheme: a client can burst up to twice the limit across a window boundary.
//!
//! The table is shared by every in-flight request. The runtime is multi-threaded, so the
//! check-and-increment runs under the `DashMap` shard lock for that key.
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    entries: DashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Count a request from `key` and report whether it is over the limit.
    pub fn is_limited(&self, key: &str) -> bool {
        self.is_limited_at(key, Instant::now())
    }

    pub fn is_limited_at(&self, key: &str, now: Instant) -> bool {
        let fresh = RateLimitEntry {
            count: 1,
            reset_at: now + self.policy.window,
        };

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut entry) if now <= entry.get().reset_at => {
                let entry = entry.get_mut();
                entry.count = entry.count.saturating_add(1);
                entry.count > self.policy.max_requests
            }
            Entry::Occupied(mut entry) => {
                entry.insert(fresh);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                false
            }
        }
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose window has ended, returning how many were removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.reset_at);
        before.saturating_sub(self.entries.len())
    }

    /// Periodically evict expired entries so the table doesn't grow with every client ever seen.
    ///
    /// The task only holds a weak reference and exits once the limiter is dropped.
    pub fn spawn_eviction(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.evict_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = limiter.len(), "Evicted expired rate limit entries");
                }
            }
        })
    }
}
