//! Per-user admission control for install and API-key requests.
//!
//! Every (user, request kind) pair keeps a single timestamp: the earliest
//! moment its next request would be on schedule (generic cell rate
//! algorithm). A quota of `n` per minute admits a burst of `n`, then one
//! request every `60s / n`. A rejection reports how long until the next slot
//! opens so callers can send `Retry-After`.
//!
//! In-memory only; resets on restart.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Request families limited independently of each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Install,
    ApiKey,
}

/// Sustained rate plus burst allowance for one request kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    /// Spacing between requests at the sustained rate.
    emission: Duration,
    /// How far ahead of schedule a caller may run (the burst).
    tolerance: Duration,
}

impl Quota {
    /// `limit` requests per minute, all of which may arrive at once.
    pub fn per_minute(limit: u64) -> Self {
        let limit = limit.max(1);
        let emission = Duration::from_nanos((WINDOW.as_nanos() / u128::from(limit)) as u64);
        Self {
            emission,
            tolerance: WINDOW.saturating_sub(emission),
        }
    }
}

/// Quotas per request kind. `None` leaves that kind unlimited.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateLimits {
    pub install: Option<Quota>,
    pub api_key: Option<Quota>,
}

impl RateLimits {
    fn quota(&self, kind: RequestKind) -> Option<Quota> {
        match kind {
            RequestKind::Install => self.install,
            RequestKind::ApiKey => self.api_key,
        }
    }
}

/// Returned when a request arrives ahead of its slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Throttled {
    pub retry_after: Duration,
}

impl Throttled {
    /// Whole seconds for a `Retry-After` header, never zero.
    pub fn retry_after_seconds(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 || secs == 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    limits: RateLimits,
    next_slot: DashMap<(String, RequestKind), Instant>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            next_slot: DashMap::new(),
        }
    }

    /// Admits one `kind` request for `user_id` or reports the wait.
    pub fn admit(&self, user_id: &str, kind: RequestKind) -> Result<(), Throttled> {
        self.admit_at(user_id, kind, Instant::now())
    }

    fn admit_at(&self, user_id: &str, kind: RequestKind, now: Instant) -> Result<(), Throttled> {
        let Some(quota) = self.limits.quota(kind) else {
            return Ok(());
        };

        let mut slot = self
            .next_slot
            .entry((user_id.to_string(), kind))
            .or_insert(now);
        let scheduled = (*slot).max(now);
        let allowed_until = now + quota.tolerance;

        if scheduled > allowed_until {
            return Err(Throttled {
                retry_after: scheduled - allowed_until,
            });
        }
        *slot = scheduled + quota.emission;
        Ok(())
    }
}
