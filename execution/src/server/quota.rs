// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use execution_util::InstanceName;

/// Per-tenant admission limits. Quotas are enforced per instance, which is this codebase's
/// tenant boundary -- see `Instance`.
#[derive(Clone, Copy, Debug)]
pub struct TenantQuota {
    /// Maximum number of Operations a tenant may have QUEUED+EXECUTING at once. `None` disables
    /// the cap.
    pub max_concurrent: Option<usize>,
    /// Token-bucket rate for `Execute` calls: sustained requests/sec, with a burst of `2x`.
    pub max_execute_rps: Option<f64>,
    /// Maximum number of concurrent BotSessions, guarding against unbounded growth of the
    /// long-poll table. `None` disables the cap. A session admitted past the cap is handed a
    /// zero-capacity `Worker` -- it long-polls and always times out rather than being refused
    /// outright, so an over-quota worker fleet degrades gracefully instead of erroring.
    pub max_sessions: Option<usize>,
}

impl Default for TenantQuota {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            max_execute_rps: None,
            max_sessions: None,
        }
    }
}

/// A token bucket with burst capacity `2x` the refill rate, refilled lazily on access.
struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec * 2.0;
        Self {
            rate_per_sec,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct TenantState {
    quota: TenantQuota,
    concurrent: usize,
    bucket: Option<TokenBucket>,
}

/// Tracks admission state for every tenant (instance) that has executed an Action. Quotas
/// themselves are supplied out of band (e.g. from config) via `set_quota`; tenants without an
/// explicit quota are unlimited, matching the "safer to admit" default for a reference
/// implementation.
#[derive(Default)]
pub struct Quotas {
    tenants: Mutex<HashMap<InstanceName, TenantState>>,
}

impl Quotas {
    pub fn set_quota(&self, tenant: InstanceName, quota: TenantQuota) {
        let mut tenants = self.tenants.lock();
        let state = tenants.entry(tenant).or_insert_with(|| TenantState {
            quota: TenantQuota::default(),
            concurrent: 0,
            bucket: None,
        });
        state.quota = quota;
        state.bucket = quota.max_execute_rps.map(TokenBucket::new);
    }

    /// Consumes one RPS token for `tenant`'s `Execute` bucket. Returns `false` (map to
    /// `ResourceExhausted`) if the bucket is empty.
    pub fn try_admit_execute(&self, tenant: &InstanceName) -> bool {
        let mut tenants = self.tenants.lock();
        let Some(state) = tenants.get_mut(tenant) else {
            return true;
        };
        match state.bucket.as_mut() {
            Some(bucket) => bucket.try_acquire(),
            None => true,
        }
    }

    /// Whether `tenant` has room under its concurrency cap for another QUEUED->EXECUTING
    /// transition. A tenant over cap is not rejected -- per spec the Action simply remains
    /// QUEUED -- so this only gates lease issuance, never `Execute` itself.
    pub fn has_concurrency_room(&self, tenant: &InstanceName) -> bool {
        let tenants = self.tenants.lock();
        match tenants.get(tenant) {
            Some(state) => match state.quota.max_concurrent {
                Some(max) => state.concurrent < max,
                None => true,
            },
            None => true,
        }
    }

    pub fn on_lease_issued(&self, tenant: &InstanceName) {
        let mut tenants = self.tenants.lock();
        if let Some(state) = tenants.get_mut(tenant) {
            state.concurrent += 1;
        }
    }

    pub fn on_lease_released(&self, tenant: &InstanceName) {
        let mut tenants = self.tenants.lock();
        if let Some(state) = tenants.get_mut(tenant) {
            state.concurrent = state.concurrent.saturating_sub(1);
        }
    }

    /// Whether `tenant` has room under its `max_sessions` cap for one more BotSession. `None` (no
    /// quota configured, or no cap set) is always unlimited.
    pub fn has_session_room(&self, tenant: &InstanceName, current_sessions: usize) -> bool {
        let tenants = self.tenants.lock();
        match tenants.get(tenant).and_then(|state| state.quota.max_sessions) {
            Some(max) => current_sessions < max,
            None => true,
        }
    }
}

/// Governs whether ties among platform-compatible queued Actions break by FIFO order (the safer,
/// fairness-preserving default) or by a strict priority ordering. See
/// `Worker::cancel_expired_and_maybe_add_new_leases` for where this is consulted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Among platform-compatible Actions, the oldest (`enqueued_at` ascending) is always picked
    /// first; `priority` only matters as a tiebreak, which in practice never applies since
    /// `enqueued_at` values are unique.
    #[default]
    Fifo,
    /// Among platform-compatible Actions, the highest `priority` is always picked first,
    /// regardless of how long a lower-priority Action has been queued; ties break FIFO.
    StrictPriority,
}

/// Default lease interval (see `create_lease`): the worker must refresh before this elapses.
pub const DEFAULT_LEASE_INTERVAL: Duration = Duration::from_secs(30);

/// Default retry budget: the number of attempts (initial + retries) before an Operation is
/// completed with `Unavailable`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default grace period a worker has to acknowledge a cancellation before its lease is
/// force-expired.
pub const DEFAULT_CANCELLATION_GRACE: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_cap_blocks_once_full() {
        let quotas = Quotas::default();
        let tenant = "acme".to_owned();
        quotas.set_quota(
            tenant.clone(),
            TenantQuota {
                max_concurrent: Some(2),
                max_execute_rps: None,
                max_sessions: None,
            },
        );

        assert!(quotas.has_concurrency_room(&tenant));
        quotas.on_lease_issued(&tenant);
        assert!(quotas.has_concurrency_room(&tenant));
        quotas.on_lease_issued(&tenant);
        assert!(!quotas.has_concurrency_room(&tenant));

        quotas.on_lease_released(&tenant);
        assert!(quotas.has_concurrency_room(&tenant));
    }

    #[test]
    fn session_cap_blocks_once_full() {
        let quotas = Quotas::default();
        let tenant = "acme".to_owned();
        quotas.set_quota(
            tenant.clone(),
            TenantQuota {
                max_concurrent: None,
                max_execute_rps: None,
                max_sessions: Some(1),
            },
        );

        assert!(quotas.has_session_room(&tenant, 0));
        assert!(!quotas.has_session_room(&tenant, 1));
    }

    #[test]
    fn unconfigured_tenant_is_unlimited() {
        let quotas = Quotas::default();
        let tenant = "unknown".to_owned();
        assert!(quotas.has_concurrency_room(&tenant));
        assert!(quotas.try_admit_execute(&tenant));
    }

    #[test]
    fn rps_bucket_rejects_past_burst() {
        let quotas = Quotas::default();
        let tenant = "acme".to_owned();
        quotas.set_quota(
            tenant.clone(),
            TenantQuota {
                max_concurrent: None,
                max_execute_rps: Some(1.0),
                max_sessions: None,
            },
        );

        // Burst capacity is 2x the rate, i.e. 2 tokens available immediately.
        assert!(quotas.try_admit_execute(&tenant));
        assert!(quotas.try_admit_execute(&tenant));
        assert!(!quotas.try_admit_execute(&tenant));
    }
}
