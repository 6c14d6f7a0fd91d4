//! Per-client rate limiting with a block-then-cooldown policy.
//!
//! Every `(client, rate)` pair owns one map entry holding its token bucket,
//! the time of its last admitted request and, while blocked, the instant the
//! block ends. The map is sharded, so a check only ever locks the shard of
//! its own key, and the eviction sweep walks one shard at a time. Because the
//! bucket and the block live in the same entry, eviction can never race with
//! an in-flight check on that key.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::time::format_local;

/// Entries untouched for longer than this are dropped by the sweep.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(15 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

type Bucket<C> = RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Limits applied to one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLimit {
    pub per_second: u32,
    pub block_duration: Duration,
}

impl RouteLimit {
    pub const fn new(per_second: u32, block_duration: Duration) -> Self {
        Self {
            per_second,
            block_duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    pub client: String,
    pub rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid rate limit configuration")]
    InvalidRate,

    #[error("too many requests, please wait until {until}")]
    Blocked { until: String },
}

struct Entry<C: Clock> {
    bucket: Bucket<C>,
    /// When the bucket is back at full capacity. `None` while it is fresh.
    refilled_at: Option<C::Instant>,
    last_access: Option<C::Instant>,
    blocked_until: Option<C::Instant>,
}

pub struct RateGovernor<C: Clock = DefaultClock> {
    entries: DashMap<LimiterKey, Entry<C>>,
    clock: C,
    /// Monotonic instant paired with the wall time it was taken at, used to
    /// render block deadlines.
    anchor: (C::Instant, DateTime<Utc>),
    idle_threshold: Duration,
}

impl RateGovernor<DefaultClock> {
    pub fn new() -> Self {
        Self::with_clock(DefaultClock::default())
    }
}

impl Default for RateGovernor<DefaultClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> RateGovernor<C> {
    pub fn with_clock(clock: C) -> Self {
        let anchor = (clock.now(), Utc::now());
        Self {
            entries: DashMap::new(),
            clock,
            anchor,
            idle_threshold: IDLE_THRESHOLD,
        }
    }

    pub fn with_idle_threshold(mut self, idle_threshold: Duration) -> Self {
        self.idle_threshold = idle_threshold;
        self
    }

    /// Admits or rejects one request from `client` under `limit`.
    pub fn check(&self, client: &str, limit: RouteLimit) -> Result<(), Rejection> {
        let Some(per_second) = NonZeroU32::new(limit.per_second) else {
            warn!(client, "rejecting request: rate limit configured as 0");
            return Err(Rejection::InvalidRate);
        };

        let key = LimiterKey {
            client: client.to_string(),
            rate: limit.per_second,
        };
        let now = self.clock.now();
        let quota = Quota::per_second(per_second).allow_burst(per_second);

        let mut entry = self.entries.entry(key).or_insert_with(|| Entry {
            bucket: RateLimiter::direct_with_clock(quota, &self.clock),
            refilled_at: None,
            last_access: None,
            blocked_until: None,
        });

        if let Some(until) = entry.blocked_until {
            if now < until {
                let until = self.render(until);
                debug!(client, %until, "client still blocked");
                return Err(Rejection::Blocked { until });
            }
            entry.blocked_until = None;
        }

        // An idle GCRA bucket admits one cell more than a fresh one. Swap a
        // refilled bucket for a fresh one so the burst stays at `per_second`.
        if entry.refilled_at.is_some_and(|at| at <= now) {
            entry.bucket = RateLimiter::direct_with_clock(quota, &self.clock);
            entry.refilled_at = None;
        }

        if entry.bucket.check().is_err() {
            let until = now + Nanos::from(limit.block_duration);
            entry.blocked_until = Some(until);
            let until = self.render(until);
            warn!(
                client,
                rate = limit.per_second,
                %until,
                "rate limit exceeded, client blocked"
            );
            return Err(Rejection::Blocked { until });
        }

        let interval = Nanos::from(quota.replenish_interval());
        entry.refilled_at = Some(entry.refilled_at.unwrap_or(now) + interval);
        entry.last_access = Some(now);
        debug!(client, rate = limit.per_second, "request admitted");
        Ok(())
    }

    /// Drops entries idle for longer than the threshold (or never admitted).
    /// Entries with a block still in force are kept so eviction cannot lift
    /// a block early. Returns the number of entries removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        self.entries.retain(|key, entry| {
            let blocked = entry.blocked_until.is_some_and(|until| now < until);
            let recent = entry.last_access.is_some_and(|seen| {
                Duration::from(now.duration_since(seen)) <= self.idle_threshold
            });

            let keep = blocked || recent;
            if !keep {
                debug!(client = %key.client, rate = key.rate, "evicting idle rate limiter");
                removed += 1;
            }
            keep
        });

        removed
    }

    pub fn contains(&self, client: &str, rate: u32) -> bool {
        self.entries.contains_key(&LimiterKey {
            client: client.to_string(),
            rate,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn render(&self, instant: C::Instant) -> String {
        let (anchor_instant, anchor_wall) = self.anchor;
        let elapsed = Duration::from(instant.duration_since(anchor_instant));
        let offset = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        format_local(anchor_wall + offset)
    }
}

/// Runs [`RateGovernor::evict_idle`] every `interval` until the runtime stops.
pub fn spawn_sweeper<C>(governor: Arc<RateGovernor<C>>, interval: Duration) -> JoinHandle<()>
where
    C: Clock + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = governor.evict_idle();
            info!(
                "Rate limiter sweep removed {} entries, {} remain",
                removed,
                governor.len()
            );
        }
    })
}
