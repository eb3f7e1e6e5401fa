//! Local sliding windows rate limiting.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::Limit;

/// Sliding window limiter. One per route.
#[derive(Debug)]
pub struct RateLimiter {
    /// Number of requests allowed per window.
    maximum_request: usize,
    window: Duration,
    /// Each key has its own window.
    buckets: DashMap<String, VecDeque<Instant>>,
    /// Last time idle buckets were dropped.
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(maximum_request: usize, window: Duration) -> Self {
        RateLimiter {
            maximum_request,
            window,
            buckets: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Checks if a new request exceeds the limit. If not, records it.
    pub fn check(&self, key: impl ToString) -> bool {
        let now = Instant::now();
        self.sweep(now);

        let mut requests = self.buckets.entry(key.to_string()).or_default();

        // clean old requests.
        while let Some(time) = requests.front() {
            if now.duration_since(*time) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() >= self.maximum_request {
            false
        } else {
            requests.push_back(now);
            true
        }
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets whose newest request left the window, at most once per window.
    /// Must not be called while a bucket guard is held.
    fn sweep(&self, now: Instant) {
        let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };

        if now.duration_since(*last_sweep) < self.window {
            return;
        }
        *last_sweep = now;

        self.buckets.retain(|_, requests| {
            requests
                .back()
                .is_some_and(|time| now.duration_since(*time) < self.window)
        });
    }
}

impl From<Limit> for RateLimiter {
    fn from(limit: Limit) -> Self {
        Self::new(limit.requests, Duration::from_secs(limit.seconds))
    }
}
