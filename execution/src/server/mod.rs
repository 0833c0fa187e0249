// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod quota;
pub mod state_store;
#[cfg(test)]
mod tests;

use std::collections::{hash_map, HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};

use digest::Digest;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use prost::Message;
use protos::build::bazel::remote::execution::v2::{
    execution_stage::Value as ExecutionStageValue, Action as ActionRequest, ActionResult,
    ExecuteOperationMetadata,
};
use protos::google::devtools::remoteworkers::v1test2::{BotSession, Lease, LeaseState};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout_at, Duration, Instant};
use tonic::{Code, Status};

use execution_util::{
    generate_operation_name, generate_uuid, platform_properties_satisfied, InstanceName,
    OperationName, PlatformProperty, SessionName,
};

use crate::{any_proto_decode, any_proto_encode};

pub use quota::{
    SchedulingPolicy, TenantQuota, DEFAULT_CANCELLATION_GRACE, DEFAULT_LEASE_INTERVAL,
    DEFAULT_MAX_ATTEMPTS,
};
use quota::Quotas;
pub use state_store::{InMemoryWalStateStore, StateStore};
use state_store::{fold_by_instance, unix_millis_after, NullStateStore, RestoredAction, Transition};

pub(crate) type ActionDigest = Digest;

type WorkerName = String;

type LeaseId = String;

/// Identifies an internally-tracked Action. Actions eligible for `Execute`-time dedup merge
/// (i.e. not `do_not_cache` and not `skip_cache_lookup`) share a key with `salt: None`, so that a
/// second `Execute` of the same digest naturally lands on the same map entry. Actions that must
/// never merge (either because the caller asked to skip the cache, or because the Action itself
/// must not be cached) get a freshly-generated salt, guaranteeing their key is unique even if an
/// identical, also-unmerged Action is in flight or was already `COMPLETED`.
type ActionKey = (ActionDigest, Option<String>);

/// Runtime-tunable scheduler behavior. See `quota` module for the defaults.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub lease_interval: Duration,
    pub max_attempts: u32,
    pub cancellation_grace: Duration,
    pub scheduling_policy: SchedulingPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_interval: DEFAULT_LEASE_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cancellation_grace: DEFAULT_CANCELLATION_GRACE,
            scheduling_policy: SchedulingPolicy::default(),
        }
    }
}

/// Outcome of attempting to publish a completed Action's result. The caller treats `Incomplete`
/// exactly like any other infrastructure loss (the attempt is requeued, consuming one of
/// `attempt_count`'s retries).
pub enum PublishOutcome {
    Published,
    Incomplete,
}

/// Validates that a worker-reported `ActionResult`'s output digests are present in the CAS, and
/// -- unless the Action is `do_not_cache` -- writes the result to the Action Cache, before the
/// Operation is allowed to transition to `COMPLETED`. All referenced output blobs must land in
/// the CAS before the Action Cache entry does, so this keeps that ordering out of the scheduler's
/// core state machine, which otherwise has no need to know about either store.
#[tonic::async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(
        &self,
        instance_name: &InstanceName,
        action_digest: ActionDigest,
        do_not_cache: bool,
        result: &ActionResult,
    ) -> PublishOutcome;
}

/// The `ResultPublisher` used when none is configured: every result is treated as already
/// complete and cacheable. This is what the in-memory scheduler tests use, since they exercise
/// the state machine without a live CAS/AC to validate against.
struct NullResultPublisher;

#[tonic::async_trait]
impl ResultPublisher for NullResultPublisher {
    async fn publish(
        &self,
        _instance_name: &InstanceName,
        _action_digest: ActionDigest,
        _do_not_cache: bool,
        _result: &ActionResult,
    ) -> PublishOutcome {
        PublishOutcome::Published
    }
}

fn worker_platform_properties(session: &BotSession) -> Vec<PlatformProperty> {
    session
        .worker
        .as_ref()
        .map(|worker| {
            worker
                .devices
                .iter()
                .flat_map(|device| device.properties.iter())
                .map(|prop| (prop.key.clone(), prop.value.clone()))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub(crate) enum ActionStatus {
    Running(ExecuteOperationMetadata),
    Completed(Result<ActionResult, Status>),
}

impl ActionStatus {
    fn running(digest: ActionDigest, stage: ExecutionStageValue) -> Self {
        Self::Running(ExecuteOperationMetadata {
            stage: stage as i32,
            action_digest: Some(digest.into()),
            ..Default::default()
        })
    }
}

struct Action {
    key: ActionKey,
    digest: ActionDigest,
    request: ActionRequest,
    platform_properties: Vec<PlatformProperty>,
    /// Parsed from the conventional `priority` platform property; higher sorts first. Used only
    /// as a tie-break among platform-compatible Actions a worker could run, per the configured
    /// `SchedulingPolicy`.
    priority: i32,
    do_not_cache: bool,
    attempt_count: u32,
    sender: watch::Sender<ActionStatus>,
    // TODO: Should (optionally) expire Operations.
    receivers: HashMap<OperationName, watch::Receiver<ActionStatus>>,
}

impl Action {
    fn new(
        initial_operation_name: OperationName,
        key: ActionKey,
        digest: ActionDigest,
        request: ActionRequest,
        platform_properties: Vec<PlatformProperty>,
        do_not_cache: bool,
    ) -> (Self, watch::Receiver<ActionStatus>) {
        let (sender, receiver) =
            watch::channel(ActionStatus::running(digest, ExecutionStageValue::Queued));

        let mut receivers = HashMap::new();
        receivers.insert(initial_operation_name, sender.subscribe());

        let priority = execution_util::parse_priority(&platform_properties);
        // The conventional `priority` property (see `parse_priority`) is a scheduling hint, not a
        // worker capability -- a worker is never expected to advertise a matching `priority`
        // property of its own, so it is excluded from the set a worker's properties must be a
        // superset of (`platform_properties_satisfied`, used when matching Actions to workers).
        let platform_properties: Vec<PlatformProperty> = platform_properties
            .into_iter()
            .filter(|(name, _)| name != "priority")
            .collect();
        let action = Action {
            key,
            digest,
            request,
            platform_properties,
            priority,
            do_not_cache,
            attempt_count: 0,
            sender,
            receivers,
        };
        (action, receiver)
    }

    fn start(&self, actions: &Actions, actions_ref: Arc<Mutex<Actions>>) -> (Lease, RunningAction) {
        let lease = create_lease(&self.request);
        let running_action = RunningAction::new(lease.id.clone(), self.key.clone(), actions_ref);
        running_action.update(actions, ExecutionStageValue::Executing);
        (lease, running_action)
    }
}

struct RunningAction {
    lease_id: LeaseId,
    key: Option<ActionKey>,
    actions: Arc<Mutex<Actions>>,
    start_time: Instant,
}

impl RunningAction {
    fn new(lease_id: LeaseId, key: ActionKey, actions: Arc<Mutex<Actions>>) -> Self {
        Self {
            lease_id,
            key: Some(key),
            actions,
            start_time: Instant::now(),
        }
    }

    fn is_cancelled(&self) -> bool {
        let Some(key) = self.key.as_ref() else {
            return true;
        };

        self.actions
            .lock()
            .all
            .get(key)
            .map(|action| action.sender.is_closed())
            .unwrap_or(true)
    }

    /// Reads back the still-live Action's digest and `do_not_cache` flag, without mutating
    /// anything. Used to decide how to publish a reported result before `complete()` removes the
    /// Action from the map.
    fn peek(&self) -> Option<(ActionDigest, bool)> {
        let key = self.key.as_ref()?;
        self.actions
            .lock()
            .all
            .get(key)
            .map(|action| (action.digest, action.do_not_cache))
    }

    fn update(&self, actions: &Actions, stage: ExecutionStageValue) {
        let Some(key) = self.key.as_ref() else { return };
        let Some(action) = actions.all.get(key) else {
            return;
        };

        log::info!(
            "[{}] Lease {} now in stage: {:?}",
            actions.instance_name,
            self.lease_id,
            stage,
        );

        let _ = action.sender.send(ActionStatus::running(action.digest, stage));
    }

    /// Completes a RunningAction successfully (or with a terminal, non-retryable error).
    ///
    /// NB: Will fail loudly if called more than once.
    fn complete(&mut self, result: Result<ActionResult, Status>) {
        let key = self.key.take().unwrap();
        let instance_name = {
            let mut actions = self.actions.lock();
            if let Some(action) = actions.all.remove(&key) {
                let _ = action.sender.send(ActionStatus::Completed(result));
            }
            actions.quotas.on_lease_released(&actions.instance_name);
            actions.state_store.append(Transition::Completed {
                instance_name: actions.instance_name.clone(),
                digest_hash_hex: key.0.hex(),
                digest_size_bytes: key.0.size_bytes,
                salt: key.1.clone(),
            });
            actions.instance_name.clone()
        };

        let elapsed = self.start_time.elapsed();
        metrics::histogram!("toolchain_execution_actions_duration_seconds", elapsed, "bucket" => "complete", "customer_id" => instance_name);
    }

    /// Shared by infrastructure-loss paths (worker lease lost, incomplete result reported): bumps
    /// `attempt_count` and either requeues the Action, or -- once `max_attempts` is reached --
    /// completes it with `Unavailable`, per the retry policy.
    fn requeue_or_fail(&mut self) {
        let Some(key) = self.key.take() else { return };
        let instance_name = {
            let mut actions = self.actions.lock();
            let max_attempts = actions.max_attempts;

            if let Some(action) = actions.all.get_mut(&key) {
                action.attempt_count += 1;
                if action.attempt_count >= max_attempts {
                    log::info!(
                        "[{}] Action {:?} exhausted its retry budget ({} attempts)",
                        actions.instance_name,
                        key.0,
                        action.attempt_count,
                    );
                    if let Some(action) = actions.all.remove(&key) {
                        let _ = action.sender.send(ActionStatus::Completed(Err(
                            Status::unavailable("too many worker failures"),
                        )));
                    }
                    actions.state_store.append(Transition::Completed {
                        instance_name: actions.instance_name.clone(),
                        digest_hash_hex: key.0.hex(),
                        digest_size_bytes: key.0.size_bytes,
                        salt: key.1.clone(),
                    });
                } else {
                    self.update(&actions, ExecutionStageValue::Queued);
                    actions.state_store.append(Transition::Requeued {
                        instance_name: actions.instance_name.clone(),
                        digest_hash_hex: key.0.hex(),
                        digest_size_bytes: key.0.size_bytes,
                        salt: key.1.clone(),
                    });
                    actions.queued.send_modify(|queued| queued.push_front(key));
                }
            }

            actions.quotas.on_lease_released(&actions.instance_name);
            actions.instance_name.clone()
        };

        let elapsed = self.start_time.elapsed();
        metrics::histogram!("toolchain_execution_actions_duration_seconds", elapsed, "bucket" => "cancelled", "customer_id" => instance_name);
    }
}

impl Drop for RunningAction {
    fn drop(&mut self) {
        if self.key.is_some() {
            self.requeue_or_fail();
        }
    }
}

struct LeaseEntry {
    running: RunningAction,
    /// Set the first time we observe that the Operation has been cancelled (its watch::Sender
    /// closed). While `Some`, we re-offer the worker a `CANCELLED` lease state on every poll; once
    /// `cancellation_grace` has elapsed since then without the worker acknowledging, the lease is
    /// force-expired.
    cancel_requested_at: Option<Instant>,
}

struct Worker {
    instance: InstanceName,
    worker_name: WorkerName,
    session_name: SessionName,
    capacity: u16,
    platform_properties: Vec<PlatformProperty>,
    leases: HashMap<LeaseId, LeaseEntry>,
    expiration: Instant,
}

impl Worker {
    fn new(
        instance: InstanceName,
        worker_name: WorkerName,
        session_name: SessionName,
        platform_properties: Vec<PlatformProperty>,
        expiration_timeout: Duration,
        capacity: u16,
    ) -> Self {
        Self {
            instance,
            session_name,
            worker_name,
            capacity,
            platform_properties,
            leases: HashMap::new(),
            expiration: Instant::now() + expiration_timeout,
        }
    }

    fn extend_expiration(&mut self, timeout: Duration) {
        self.expiration = Instant::now() + timeout;
    }

    /// Removes every lease the worker reported as `COMPLETED`/`CANCELLED` from both the session
    /// and this Worker's tracked leases, decoding each one's terminal result/status. Callers must
    /// finalize the returned entries via `finalize_completed_lease` -- deliberately split out of
    /// this (synchronous) method and called only after the `self.workers` lock has been released,
    /// so that validating a result against the CAS/AC (an RPC round-trip) never stalls every other
    /// worker session on the instance.
    fn take_finished_leases(
        &mut self,
        session: &mut BotSession,
    ) -> Vec<(LeaseEntry, Result<ActionResult, Status>)> {
        let mut finished = Vec::new();
        session.leases.retain(|lease| {
            let lease_state = LeaseState::from_i32(lease.state);
            if matches!(
                lease_state,
                Some(LeaseState::Completed | LeaseState::Cancelled)
            ) {
                finished.push(lease.clone());
                false
            } else {
                true
            }
        });

        finished
            .into_iter()
            .filter_map(|lease| {
                let entry = self.leases.remove(&lease.id)?;
                let status = lease
                    .status
                    .as_ref()
                    .map(|status| Status::new(Code::from_i32(status.code), &status.message))
                    .unwrap_or_else(|| Status::cancelled("Unknown status."));
                let result = if status.code() == Code::Ok {
                    any_proto_decode(lease.result.as_ref()).map_err(|e| {
                        Status::internal(format!("Failed to decode action result from lease: {e}"))
                    })
                } else {
                    Err(status)
                };
                Some((entry, result))
            })
            .collect()
    }

    /// If changes were made to the BotSession, then returns true.
    fn cancel_expired_and_maybe_add_new_leases(
        &mut self,
        actions_ref: &Arc<Mutex<Actions>>,
        quotas: &Quotas,
        session: &mut BotSession,
        config: &SchedulerConfig,
    ) -> bool {
        let mut session_changed = false;
        let now = Instant::now();

        // Cancel any leases which the server is no longer tracking, or for which cancellation was
        // requested -- giving the worker `cancellation_grace` to acknowledge before force-expiry.
        session.leases.retain_mut(|lease| {
            let is_cancelled = match self.leases.get(&lease.id) {
                Some(entry) => entry.running.is_cancelled(),
                None => return false,
            };
            if !is_cancelled {
                return true;
            }

            let cancel_requested_at = self
                .leases
                .get(&lease.id)
                .and_then(|entry| entry.cancel_requested_at);

            match cancel_requested_at {
                None => {
                    if let Some(entry) = self.leases.get_mut(&lease.id) {
                        entry.cancel_requested_at = Some(now);
                    }
                    lease.state = LeaseState::Cancelled as i32;
                    session_changed = true;
                    true
                }
                Some(requested_at) if now.duration_since(requested_at) < config.cancellation_grace => {
                    lease.state = LeaseState::Cancelled as i32;
                    true
                }
                Some(_) => {
                    log::info!(
                        "[{}] Worker {} did not acknowledge cancellation of lease {} within the \
                        grace period; force-expiring.",
                        self.instance,
                        self.worker_name,
                        lease.id,
                    );
                    self.leases.remove(&lease.id);
                    session_changed = true;
                    false
                }
            }
        });

        // Create new leases for any Actions we can acquire, respecting the tenant's concurrency
        // quota: a tenant over its cap simply leaves Actions QUEUED rather than failing them.
        let actions = actions_ref.lock();

        // The worker is here and polling, so every lease it still holds is proven alive; record a
        // fresh deadline for each so a restart-time replay knows how much longer to wait before
        // reclaiming it (see `state_store`).
        for entry in self.leases.values() {
            if let Some(key) = entry.running.key.as_ref() {
                actions.state_store.append(Transition::LeaseRefreshed {
                    instance_name: actions.instance_name.clone(),
                    digest_hash_hex: key.0.hex(),
                    digest_size_bytes: key.0.size_bytes,
                    salt: key.1.clone(),
                    deadline_unix_millis: unix_millis_after(config.lease_interval),
                });
            }
        }

        let mut acquire_leases = self.capacity as usize - self.leases.len();
        let worker_platform = &self.platform_properties;
        actions.queued.send_if_modified(|queued| {
            let mut modified = false;
            while acquire_leases > 0 {
                if !quotas.has_concurrency_room(&self.instance) {
                    break;
                }

                // Among the Actions this worker is eligible to run, `queued` is already in
                // `enqueued_at` order. Under `Fifo` (the default) the oldest eligible entry always
                // wins -- `priority` is a no-op tiebreak since `enqueued_at` values are unique.
                // Under `StrictPriority`, the highest-`priority` eligible entry wins regardless of
                // age, with ties broken by whichever was seen first (i.e. FIFO order).
                let eligible = || {
                    queued.iter().enumerate().filter_map(|(idx, key)| {
                        let action = actions.all.get(key)?;
                        platform_properties_satisfied(&action.platform_properties, worker_platform)
                            .then_some((idx, action.priority))
                    })
                };
                let idx = match config.scheduling_policy {
                    SchedulingPolicy::Fifo => eligible().next().map(|(idx, _)| idx),
                    SchedulingPolicy::StrictPriority => eligible()
                        .fold(None, |best: Option<(usize, i32)>, (idx, priority)| {
                            match best {
                                Some((_, best_priority)) if best_priority >= priority => best,
                                _ => Some((idx, priority)),
                            }
                        })
                        .map(|(idx, _)| idx),
                };
                let Some(idx) = idx else {
                    break;
                };
                let Some(key) = queued.remove(idx) else {
                    break;
                };
                modified = true;

                let Some(action) = actions.all.get(&key) else {
                    continue;
                };

                let (lease, running_action) = action.start(&actions, actions_ref.clone());
                log::info!(
                    "[{}] Worker {} (session {}) acquiring lease {} for action {:?}",
                    self.instance,
                    self.worker_name,
                    self.session_name,
                    lease.id,
                    action.digest,
                );
                quotas.on_lease_issued(&self.instance);
                actions.state_store.append(Transition::LeaseIssued {
                    instance_name: actions.instance_name.clone(),
                    digest_hash_hex: key.0.hex(),
                    digest_size_bytes: key.0.size_bytes,
                    salt: key.1.clone(),
                    deadline_unix_millis: unix_millis_after(config.lease_interval),
                });
                session.leases.push(lease.clone());
                self.leases.insert(
                    lease.id.clone(),
                    LeaseEntry {
                        running: running_action,
                        cancel_requested_at: None,
                    },
                );
                acquire_leases -= 1;
                session_changed = true
            }
            modified
        });

        session_changed
    }
}

/// Publishes a single completed lease's result and then finalizes its `RunningAction`
/// accordingly. Run outside of any `Workers`-level lock.
async fn finalize_completed_lease(
    instance_name: &InstanceName,
    publisher: &Arc<dyn ResultPublisher>,
    mut entry: LeaseEntry,
    result: Result<ActionResult, Status>,
) {
    match result {
        Ok(action_result) => {
            let outcome = match entry.running.peek() {
                Some((action_digest, do_not_cache)) => {
                    publisher
                        .publish(instance_name, action_digest, do_not_cache, &action_result)
                        .await
                }
                // The Operation was already reaped (e.g. a racing cancel); nothing to do.
                None => PublishOutcome::Published,
            };
            match outcome {
                PublishOutcome::Published => entry.running.complete(Ok(action_result)),
                PublishOutcome::Incomplete => {
                    log::info!(
                        "[{instance_name}] Lease {} reported an incomplete result; retrying",
                        entry.running.lease_id,
                    );
                    entry.running.requeue_or_fail();
                }
            }
        }
        Err(status) => entry.running.complete(Err(status)),
    }
}

struct Workers {
    instance_name: InstanceName,
    workers: Mutex<HashMap<SessionName, Worker>>,
    expiration_timeout: Duration,
    quotas: Arc<Quotas>,
}

impl Workers {
    fn new(instance_name: InstanceName, expiration_timeout: Duration, quotas: Arc<Quotas>) -> Arc<Self> {
        let workers = Arc::new(Self {
            instance_name,
            workers: Mutex::default(),
            expiration_timeout,
            quotas,
        });
        tokio::spawn(Self::worker_expiration_task(Arc::downgrade(&workers)));
        workers
    }

    async fn worker_expiration_task(workers: Weak<Workers>) {
        let mut next_deadline = Instant::now();
        loop {
            // Wait until the next worker expiration deadline.
            sleep_until(next_deadline).await;

            let Some(workers) = workers.upgrade() else {
                // The Instance is shutting down.
                return;
            };

            // Remove any workers which have expired, while updating our next_deadline to the minimum
            // deadline of surviving workers.
            let now = Instant::now();
            next_deadline = now + workers.expiration_timeout;
            workers.workers.lock().retain(|_session_name, worker| {
                if worker.expiration < now {
                    // Worker session has expired.
                    false
                } else {
                    if worker.expiration < next_deadline {
                        next_deadline = worker.expiration;
                    }
                    true
                }
            });
        }
    }

    /// Acquires exclusive access to a Worker with the given SessionName until the returned guard
    /// is dropped.
    fn worker(
        &self,
        worker_name: WorkerName,
        session_name: SessionName,
        platform_properties: Vec<PlatformProperty>,
    ) -> MappedMutexGuard<Worker> {
        let quotas = &self.quotas;
        let instance_name = &self.instance_name;
        MutexGuard::map(self.workers.lock(), |workers| {
            let session_count = workers.len();
            workers.entry(session_name.clone()).or_insert_with(|| {
                // A session admitted past the per-tenant cap still gets a `Worker`, just one
                // with zero lease capacity: it long-polls and always times out empty-handed rather
                // than being refused outright, so an over-quota worker fleet degrades gracefully.
                let capacity = if quotas.has_session_room(instance_name, session_count) {
                    // TODO: `buildbox` does not put anything useful in the BotSession.worker struct
                    // about the total capacity. But it could be encoded in a platform property.
                    1
                } else {
                    log::warn!(
                        "[{instance_name}] session cap reached; admitting {session_name} with no \
                         lease capacity until a slot frees",
                    );
                    0
                };
                Worker::new(
                    instance_name.clone(),
                    worker_name,
                    session_name,
                    platform_properties,
                    self.expiration_timeout,
                    capacity,
                )
            })
        })
    }

    fn update_gauges(&self) {
        let count = self.workers.lock().len();
        metrics::gauge!("toolchain_execution_workers_state", count as f64, "bucket" => "ok", "customer_id" => self.instance_name.clone());
    }
}

struct Actions {
    instance_name: InstanceName,
    all: HashMap<ActionKey, Action>,
    queued: watch::Sender<VecDeque<ActionKey>>,
    quotas: Arc<Quotas>,
    max_attempts: u32,
    state_store: Arc<dyn StateStore>,
}

impl Actions {
    fn new(
        instance_name: InstanceName,
        quotas: Arc<Quotas>,
        max_attempts: u32,
        state_store: Arc<dyn StateStore>,
    ) -> Arc<Mutex<Self>> {
        let (sender, _receiver) = watch::channel(VecDeque::new());
        Arc::new(Mutex::new(Self {
            instance_name,
            all: HashMap::default(),
            queued: sender,
            quotas,
            max_attempts,
            state_store,
        }))
    }

    fn update_gauges(&self) {
        let queued_keys: HashSet<ActionKey> = self.queued.borrow().iter().cloned().collect();
        let (mut queued, mut executing) = (0, 0);
        for key in self.all.keys() {
            if queued_keys.contains(key) {
                queued += 1;
            } else {
                executing += 1;
            }
        }
        metrics::gauge!("toolchain_execution_actions_state", queued as f64, "bucket" => "queued", "customer_id" => self.instance_name.clone());
        metrics::gauge!("toolchain_execution_actions_state", executing as f64, "bucket" => "executing", "customer_id" => self.instance_name.clone());
    }
}

// NB: The Actions lock may be acquired under the Workers lock, but not the reverse.
#[derive(Clone)]
pub(crate) struct Instance {
    name: InstanceName,
    actions: Arc<Mutex<Actions>>,
    workers: Arc<Workers>,
    quotas: Arc<Quotas>,
    config: SchedulerConfig,
    publisher: Arc<dyn ResultPublisher>,
}

impl Instance {
    fn new(name: InstanceName, expiration_timeout: Duration) -> Self {
        Self::with_config(name, expiration_timeout, SchedulerConfig::default())
    }

    fn with_config(name: InstanceName, expiration_timeout: Duration, config: SchedulerConfig) -> Self {
        Self::with_config_and_publisher(
            name,
            expiration_timeout,
            config,
            Arc::new(NullResultPublisher),
        )
    }

    pub(crate) fn with_config_and_publisher(
        name: InstanceName,
        expiration_timeout: Duration,
        config: SchedulerConfig,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self::with_config_publisher_and_state_store(
            name,
            expiration_timeout,
            config,
            publisher,
            Arc::new(NullStateStore),
        )
    }

    /// Like `with_config_and_publisher`, but durably recording every committed transition (see
    /// `state_store`) instead of discarding them. Used by `Instances::restore` and by production
    /// callers that configure a WAL path.
    pub(crate) fn with_config_publisher_and_state_store(
        name: InstanceName,
        expiration_timeout: Duration,
        config: SchedulerConfig,
        publisher: Arc<dyn ResultPublisher>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        let quotas = Arc::new(Quotas::default());
        Self {
            name: name.clone(),
            actions: Actions::new(
                name.clone(),
                quotas.clone(),
                config.max_attempts,
                state_store,
            ),
            workers: Workers::new(name, expiration_timeout, quotas.clone()),
            quotas,
            config,
            publisher,
        }
    }

    pub(crate) fn set_tenant_quota(&self, quota: TenantQuota) {
        self.quotas.set_quota(self.name.clone(), quota);
    }

    /// Admits an `Execute` RPS-wise (token bucket with burst 2x); returns `false` if the tenant's
    /// rate limit is currently exhausted, which the caller should map to `ResourceExhausted`.
    pub(crate) fn try_admit_execute(&self) -> bool {
        self.quotas.try_admit_execute(&self.name)
    }

    /// Registers a new Action for execution, applying the dedup-merge and do-not-cache rules: an
    /// Action eligible for merge (not `do_not_cache`, caller did not request `skip_cache_lookup`)
    /// attaches to any existing non-terminal Operation for the same digest; otherwise a fresh,
    /// uniquely-salted entry is always created.
    pub(crate) fn execute(
        &self,
        action_digest: Digest,
        action_request: ActionRequest,
        platform_properties: Vec<PlatformProperty>,
        do_not_cache: bool,
        skip_cache_lookup: bool,
    ) -> (OperationName, watch::Receiver<ActionStatus>) {
        let operation_name = generate_operation_name(&self.name);
        let mergeable = !do_not_cache && !skip_cache_lookup;
        let mut actions = self.actions.lock();

        let receiver = if mergeable {
            let key: ActionKey = (action_digest, None);
            match actions.all.entry(key.clone()) {
                hash_map::Entry::Occupied(mut oe) => {
                    // Create a new receiver. Operation names must not collide, so we know that
                    // this will be a brand new receiver.
                    let receiver = oe.get().sender.subscribe();
                    oe.get_mut()
                        .receivers
                        .insert(operation_name.clone(), receiver.clone());
                    receiver
                }
                hash_map::Entry::Vacant(ve) => {
                    actions.state_store.append(Transition::Enqueued {
                        instance_name: self.name.clone(),
                        operation_name: operation_name.clone(),
                        digest_hash_hex: action_digest.hex(),
                        digest_size_bytes: action_digest.size_bytes,
                        salt: key.1.clone(),
                        action_request: action_request.encode_to_vec(),
                        platform_properties: platform_properties.clone(),
                        do_not_cache,
                    });
                    let (action, receiver) = Action::new(
                        operation_name.clone(),
                        key.clone(),
                        action_digest,
                        action_request,
                        platform_properties,
                        do_not_cache,
                    );
                    log::info!("[{}] Queueing new action for {action_digest:?}", self.name);
                    ve.insert(action);
                    actions.queued.send_modify(|queued| queued.push_back(key));
                    receiver
                }
            }
        } else {
            // `do_not_cache` Actions never dedupe, and a `skip_cache_lookup` caller explicitly
            // wants its own Operation -- a fresh salt guarantees this key cannot already exist.
            let key: ActionKey = (action_digest, Some(generate_uuid()));
            actions.state_store.append(Transition::Enqueued {
                instance_name: self.name.clone(),
                operation_name: operation_name.clone(),
                digest_hash_hex: action_digest.hex(),
                digest_size_bytes: action_digest.size_bytes,
                salt: key.1.clone(),
                action_request: action_request.encode_to_vec(),
                platform_properties: platform_properties.clone(),
                do_not_cache,
            });
            let (action, receiver) = Action::new(
                operation_name.clone(),
                key.clone(),
                action_digest,
                action_request,
                platform_properties,
                do_not_cache,
            );
            log::info!(
                "[{}] Queueing new (non-merging) action for {action_digest:?}",
                self.name
            );
            actions.all.insert(key.clone(), action);
            actions.queued.send_modify(|queued| queued.push_back(key));
            receiver
        };

        (operation_name, receiver)
    }

    /// Reinserts an Action recovered from the durable log (`Instances::restore`) without going
    /// through the normal `execute()` admission path, since the caller that originally submitted
    /// it is gone. An Action whose lease had not yet expired at restore time is kept out of the
    /// queue until that remaining time elapses, mirroring how it would have timed out had the
    /// server never restarted at all (the worker session that held it cannot itself resurface).
    fn restore_action(
        &self,
        digest: ActionDigest,
        salt: Option<String>,
        restored: RestoredAction,
    ) {
        let key: ActionKey = (digest, salt);
        let queue_immediately = !matches!(restored.lease_remaining, Some(Some(_)));
        let delay = match restored.lease_remaining {
            Some(Some(remaining)) => Some(remaining),
            _ => None,
        };

        let (action, _receiver) = Action::new(
            restored.operation_name,
            key.clone(),
            digest,
            restored.action_request,
            restored.platform_properties,
            restored.do_not_cache,
        );

        {
            let mut actions = self.actions.lock();
            actions.all.insert(key.clone(), action);
            if queue_immediately {
                actions.queued.send_modify(|queued| queued.push_back(key.clone()));
            }
        }

        if let Some(remaining) = delay {
            let actions_ref = self.actions.clone();
            tokio::spawn(async move {
                sleep(remaining).await;
                let mut actions = actions_ref.lock();
                if actions.all.contains_key(&key) {
                    actions.queued.send_modify(|queued| {
                        if !queued.contains(&key) {
                            queued.push_back(key.clone());
                        }
                    });
                }
            });
        }
    }

    pub(crate) fn wait(
        &self,
        operation_name: &OperationName,
    ) -> Option<watch::Receiver<ActionStatus>> {
        // NB: Linear time. Consider indexing, or (encoding more information in the operation
        // name) if it shows up in profiles.
        self.actions
            .lock()
            .all
            .values()
            .find_map(|action| action.receivers.get(operation_name).cloned())
    }

    pub(crate) fn cancel(&self, operation_name: OperationName) {
        // NB: Linear time. Consider indexing, or (encoding more information in the operation
        // name) if it shows up in profiles.
        let mut actions = self.actions.lock();
        let mut keys_to_remove = Vec::new();
        for action in actions.all.values_mut() {
            action.receivers.remove(&operation_name);
            if action.sender.is_closed() {
                keys_to_remove.push(action.key.clone());
            }
        }
        if !keys_to_remove.is_empty() {
            actions.state_store.append(Transition::Cancelled {
                instance_name: actions.instance_name.clone(),
                operation_name,
            });
        }
        for key in keys_to_remove {
            actions.all.remove(&key);
        }
    }

    pub(crate) async fn poll(&self, session: &mut BotSession, deadline_timeout: Duration) {
        let deadline = Instant::now() + deadline_timeout;
        let platform_properties = worker_platform_properties(session);

        // Finalize and remove any completed leases in the session. The worker lock is held only
        // long enough to pull the finished leases out; publishing (which may make RPCs) and
        // finalizing happen afterward, without blocking other sessions on this instance.
        let finished = self
            .workers
            .worker(
                session.bot_id.clone(),
                session.name.clone(),
                platform_properties.clone(),
            )
            .take_finished_leases(session);
        for (entry, result) in finished {
            finalize_completed_lease(&self.name, &self.publisher, entry, result).await;
        }

        // Then, check if there are any new leases, and if not, wait for notification of a change.
        let mut actions_queued = self.actions.lock().queued.subscribe();
        loop {
            {
                let mut worker = self.workers.worker(
                    session.bot_id.clone(),
                    session.name.clone(),
                    platform_properties.clone(),
                );
                worker.extend_expiration(self.workers.expiration_timeout);

                let session_changed = worker.cancel_expired_and_maybe_add_new_leases(
                    &self.actions,
                    &self.quotas,
                    session,
                    &self.config,
                );

                // If we made changes to the session, or the worker has ongoing leases to manage,
                // then don't wait for new leases to arrive, as it might delay completing the
                // existing work.
                if session_changed || !session.leases.is_empty() {
                    break;
                }
            }

            // Wait for any new leases outside the lock, but return immediately if we hit the
            // deadline.
            if timeout_at(deadline, actions_queued.changed())
                .await
                .is_err()
            {
                break;
            }
        }
    }

    fn update_gauges(&self) {
        self.workers.update_gauges();
        self.actions.lock().update_gauges();
    }
}

#[derive(Clone)]
pub struct Instances {
    instances: Arc<Mutex<HashMap<InstanceName, Instance>>>,
    config: SchedulerConfig,
    publisher: Arc<dyn ResultPublisher>,
    state_store: Arc<dyn StateStore>,
}

impl Default for Instances {
    fn default() -> Self {
        Self {
            instances: Arc::default(),
            config: SchedulerConfig::default(),
            publisher: Arc::new(NullResultPublisher),
            state_store: Arc::new(NullStateStore),
        }
    }
}

impl Instances {
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            instances: Arc::default(),
            config,
            publisher: Arc::new(NullResultPublisher),
            state_store: Arc::new(NullStateStore),
        }
    }

    /// Used in production, where results must be validated against CAS and written to the Action
    /// Cache before an Operation is allowed to complete.
    pub fn with_config_and_publisher(
        config: SchedulerConfig,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self {
            instances: Arc::default(),
            config,
            publisher,
            state_store: Arc::new(NullStateStore),
        }
    }

    /// Opens (or creates) a durable WAL at `wal_path`, replays any Actions it already recorded
    /// (an EXECUTING lease whose deadline has already passed is reclaimed straight to QUEUED; one
    /// still within its deadline is restored EXECUTING, with a timer armed to reclaim it itself
    /// once that deadline arrives, since the worker session that held it cannot itself survive
    /// the restart), and returns an `Instances` that will keep recording to that same WAL going
    /// forward.
    pub fn restore(
        wal_path: &Path,
        config: SchedulerConfig,
        publisher: Arc<dyn ResultPublisher>,
    ) -> io::Result<Self> {
        let state_store = Arc::new(InMemoryWalStateStore::open(wal_path)?);
        let by_instance = fold_by_instance(state_store.snapshot());

        let this = Self {
            instances: Arc::default(),
            config,
            publisher,
            state_store: state_store as Arc<dyn StateStore>,
        };

        for (instance_name, restored_actions) in by_instance {
            let instance = this.instance(instance_name);
            for ((digest, salt), restored) in restored_actions {
                instance.restore_action(digest, salt, restored);
            }
        }

        Ok(this)
    }

    pub(crate) fn instance(&self, name: InstanceName) -> Instance {
        let config = self.config;
        let publisher = self.publisher.clone();
        let state_store = self.state_store.clone();
        self.instances
            .lock()
            .entry(name.clone())
            .or_insert_with(|| {
                Instance::with_config_publisher_and_state_store(
                    name,
                    Duration::from_secs(60),
                    config,
                    publisher,
                    state_store,
                )
            })
            .clone()
    }

    /// Sets the per-tenant quota that `instance_name`'s `Instance` enforces, creating the
    /// `Instance` if it does not yet exist.
    pub fn set_tenant_quota(&self, instance_name: InstanceName, quota: TenantQuota) {
        self.instance(instance_name).set_tenant_quota(quota);
    }

    /// Updates metrics gauges for all Instances.
    pub(crate) fn update_gauges(&self) {
        // Clone all Instances and then release the lock.
        let instances: Vec<Instance> = {
            let instances = self.instances.lock();
            instances.values().cloned().collect()
        };

        for instance in instances {
            instance.update_gauges();
        }
    }
}

fn generate_lease_id() -> LeaseId {
    generate_uuid()
}

fn create_lease(action: &ActionRequest) -> Lease {
    #[allow(deprecated)]
    Lease {
        id: generate_lease_id(),
        payload: Some(any_proto_encode(action)),
        result: None,
        state: LeaseState::Pending as i32,
        status: None,
        // TODO
        requirements: None,
        expire_time: None,
        // NB: We set allow(deprecated) above in order to set these. Using `..Default::default()`
        // would obscure new fields being added to the struct.
        assignment: "".to_owned(),
        inline_assignment: None,
    }
}
