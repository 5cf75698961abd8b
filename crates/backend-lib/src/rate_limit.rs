// ============================
// crates/backend-lib/src/rate_limit.rs
// ============================
//! Windowed request counting with temporary blocking.
//!
//! Each (client key, category) pair owns one record. Once a record exceeds
//! its category limit inside the current window it is blocked for the
//! configured block duration; blocks expire by comparison at check time.

use dashmap::DashMap;
use metrics::counter;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{RateLimitSettings, WindowLimit};
use crate::metrics::RATE_LIMITED;

/// Independent limit categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Connection,
    Join,
    Response,
    Command,
}

impl RateCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RateCategory::Connection => "connection",
            RateCategory::Join => "join",
            RateCategory::Response => "response",
            RateCategory::Command => "command",
        }
    }
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window size and request budget for one category
#[derive(Debug, Clone, Copy)]
pub struct CategoryLimit {
    pub window: Duration,
    pub max_requests: u32,
}

impl From<WindowLimit> for CategoryLimit {
    fn from(limit: WindowLimit) -> Self {
        Self {
            window: Duration::from_secs(limit.window_secs),
            max_requests: limit.max_requests,
        }
    }
}

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// When the current window (or block) ends
    pub reset_at: Instant,
    pub blocked: bool,
}

impl RateDecision {
    /// Milliseconds until `reset_at`, saturating at zero
    pub fn retry_after_ms(&self, now: Instant) -> u64 {
        u64::try_from(self.reset_at.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX)
    }
}

/// Entry in the rate limit map
#[derive(Debug, Clone)]
struct RateLimitRecord {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

/// Rate limiter shared by the gateway and the connection middleware
#[derive(Debug)]
pub struct RateLimiter {
    records: DashMap<(String, RateCategory), RateLimitRecord>,
    connection: CategoryLimit,
    join: CategoryLimit,
    response: CategoryLimit,
    command: CategoryLimit,
    block_duration: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_settings(&RateLimitSettings::default())
    }
}

impl RateLimiter {
    /// Create a rate limiter from configuration
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            records: DashMap::new(),
            connection: settings.connection.into(),
            join: settings.join.into(),
            response: settings.response.into(),
            command: settings.command.into(),
            block_duration: Duration::from_secs(settings.block_secs),
        }
    }

    /// Override the limit for one category
    pub fn with_limit(mut self, category: RateCategory, limit: CategoryLimit) -> Self {
        *self.limit_mut(category) = limit;
        self
    }

    /// Override the block duration
    pub fn with_block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }

    pub fn limit(&self, category: RateCategory) -> CategoryLimit {
        match category {
            RateCategory::Connection => self.connection,
            RateCategory::Join => self.join,
            RateCategory::Response => self.response,
            RateCategory::Command => self.command,
        }
    }

    fn limit_mut(&mut self, category: RateCategory) -> &mut CategoryLimit {
        match category {
            RateCategory::Connection => &mut self.connection,
            RateCategory::Join => &mut self.join,
            RateCategory::Response => &mut self.response,
            RateCategory::Command => &mut self.command,
        }
    }

    /// Count one request for `key` in `category`
    pub fn check(&self, key: &str, category: RateCategory) -> RateDecision {
        self.check_at(key, category, Instant::now())
    }

    /// Count one request at an explicit instant
    pub fn check_at(&self, key: &str, category: RateCategory, now: Instant) -> RateDecision {
        let limit = self.limit(category);

        // The entry guard holds the shard lock, so check-and-increment is atomic
        let mut record = self
            .records
            .entry((key.to_string(), category))
            .or_insert_with(|| RateLimitRecord {
                window_start: now,
                count: 0,
                blocked_until: None,
            });

        if let Some(until) = record.blocked_until {
            if now < until {
                counter!(RATE_LIMITED, "category" => category.as_str()).increment(1);
                return RateDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at: until,
                    blocked: true,
                };
            }
            // Block has expired; start over with a fresh window
            record.blocked_until = None;
            record.window_start = now;
            record.count = 0;
        }

        if now.duration_since(record.window_start) >= limit.window {
            record.window_start = now;
            record.count = 0;
        }

        record.count += 1;

        if record.count > limit.max_requests {
            let until = now + self.block_duration;
            record.blocked_until = Some(until);
            warn!(key, %category, "rate limit exceeded, blocking");
            counter!(RATE_LIMITED, "category" => category.as_str()).increment(1);
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: until,
                blocked: true,
            };
        }

        RateDecision {
            allowed: true,
            remaining: limit.max_requests - record.count,
            reset_at: record.window_start + limit.window,
            blocked: false,
        }
    }

    /// Clean up expired windows and expired blocks
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    pub fn cleanup_at(&self, now: Instant) {
        let before = self.records.len();
        self.records.retain(|(_, category), record| match record.blocked_until {
            Some(until) => now < until,
            None => now.duration_since(record.window_start) < self.limit(*category).window,
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "purged expired rate limit records");
        }
    }

    /// Number of tracked records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
