// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Durability for the in-memory scheduler state, guarding against losing all in-flight work on a
//! process restart. The scheduler's `Instance`/`Worker`/`Action` types never read or write the log
//! themselves -- they only ever call `StateStore::append`, and restoration happens once, up
//! front, via `super::Instances::restore`. A clustered, KV-backed `StateStore` is a natural next
//! step but out of scope here; only the trait boundary is load-bearing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use prost::Message;
use serde::{Deserialize, Serialize};

use protos::build::bazel::remote::execution::v2::Action as ActionRequest;

use execution_util::{InstanceName, OperationName, PlatformProperty};

use super::ActionDigest;

/// One committed change to the scheduler's durable state. Every variant carries enough to replay
/// the scheduler's queue/action-table state from scratch; it deliberately does not carry anything
/// about which worker a lease is assigned to, since worker sessions are inherently ephemeral
/// (bots reconnect with a brand new `BotSession` after any restart) and are not restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Transition {
    /// A new Action was admitted and queued.
    Enqueued {
        instance_name: InstanceName,
        operation_name: OperationName,
        digest_hash_hex: String,
        digest_size_bytes: usize,
        /// `None` for Actions eligible to dedup-merge; `Some` (a random salt) otherwise. See
        /// `ActionKey`.
        salt: Option<String>,
        /// The wire-encoded `Action` proto, so the Action can be re-offered to a worker without
        /// the original `Execute` caller resubmitting it.
        action_request: Vec<u8>,
        platform_properties: Vec<PlatformProperty>,
        do_not_cache: bool,
    },
    /// A worker was issued a lease for an Action, moving it from QUEUED to EXECUTING.
    LeaseIssued {
        instance_name: InstanceName,
        digest_hash_hex: String,
        digest_size_bytes: usize,
        salt: Option<String>,
        /// Unix-epoch milliseconds by which the lease must be refreshed or reclaimed.
        deadline_unix_millis: u64,
    },
    /// An already-issued lease's deadline was pushed out (the worker is still alive and polling).
    LeaseRefreshed {
        instance_name: InstanceName,
        digest_hash_hex: String,
        digest_size_bytes: usize,
        salt: Option<String>,
        deadline_unix_millis: u64,
    },
    /// The Action reached a terminal, successful-or-failed result.
    Completed {
        instance_name: InstanceName,
        digest_hash_hex: String,
        digest_size_bytes: usize,
        salt: Option<String>,
    },
    /// The Operation was cancelled by its caller.
    Cancelled {
        instance_name: InstanceName,
        operation_name: OperationName,
    },
    /// A lease was lost (worker/infra failure) and the Action was returned to QUEUED to be
    /// retried, short of its retry budget.
    Requeued {
        instance_name: InstanceName,
        digest_hash_hex: String,
        digest_size_bytes: usize,
        salt: Option<String>,
    },
}

/// Capability boundary between the scheduler's logic and however its state is made durable.
/// `Instance`/`Worker`/`Action` call `append` as transitions commit; nothing else about the log's
/// schema or storage leaks into the scheduler itself.
pub trait StateStore: Send + Sync {
    fn append(&self, transition: Transition);

    /// Every transition recorded so far, oldest first.
    fn snapshot(&self) -> Vec<Transition>;
}

/// A `StateStore` that keeps every transition in memory and never persists anything. Used
/// whenever no WAL path is configured (e.g. in tests), matching `NullResultPublisher`'s role for
/// `ResultPublisher`.
#[derive(Default)]
pub struct NullStateStore;

impl StateStore for NullStateStore {
    fn append(&self, _transition: Transition) {}

    fn snapshot(&self) -> Vec<Transition> {
        Vec::new()
    }
}

/// The default durable `StateStore`: an in-memory mirror of every transition, backed by an
/// append-only, newline-delimited-JSON log file (matching this codebase's existing
/// `serde_json`/`serde_yaml` use elsewhere). Every `append` is immediately flushed, so a crash
/// loses at most the transition that was in flight when it happened.
pub struct InMemoryWalStateStore {
    log: StdMutex<Vec<Transition>>,
    file: StdMutex<File>,
}

impl InMemoryWalStateStore {
    /// Opens (creating if necessary) the WAL file at `path`, replaying any transitions already
    /// recorded into the in-memory mirror. Malformed trailing lines (e.g. a torn write from a
    /// crash mid-`append`) are logged and skipped rather than failing the whole replay.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;

        let mut log = Vec::new();
        for (line_number, line) in BufReader::new(file.try_clone()?).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Transition>(&line) {
                Ok(transition) => log.push(transition),
                Err(e) => log::warn!(
                    "skipping malformed state-store WAL record at {}:{}: {e}",
                    path.display(),
                    line_number + 1,
                ),
            }
        }

        Ok(Self {
            log: StdMutex::new(log),
            file: StdMutex::new(file),
        })
    }
}

impl StateStore for InMemoryWalStateStore {
    fn append(&self, transition: Transition) {
        if let Ok(line) = serde_json::to_string(&transition) {
            let mut file = self.file.lock().unwrap();
            if let Err(e) = writeln!(file, "{line}") {
                log::warn!("failed to append to state-store WAL: {e}");
            } else if let Err(e) = file.flush() {
                log::warn!("failed to flush state-store WAL: {e}");
            }
        }
        self.log.lock().unwrap().push(transition);
    }

    fn snapshot(&self) -> Vec<Transition> {
        self.log.lock().unwrap().clone()
    }
}

pub(crate) fn unix_millis_after(duration: StdDuration) -> u64 {
    (SystemTime::now() + duration)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How far in the future `deadline_unix_millis` still is, or `None` if it has already passed.
pub(crate) fn remaining_until(deadline_unix_millis: u64) -> Option<StdDuration> {
    let deadline = UNIX_EPOCH + StdDuration::from_millis(deadline_unix_millis);
    deadline.duration_since(SystemTime::now()).ok()
}

/// The folded, final state of one Action key as of the end of the log, used by
/// `Instances::restore` to reconstruct the action table without replaying the scheduler's normal
/// (stateful, watch-channel-driven) transition logic.
pub(crate) struct RestoredAction {
    pub(crate) operation_name: OperationName,
    pub(crate) action_request: ActionRequest,
    pub(crate) platform_properties: Vec<PlatformProperty>,
    pub(crate) do_not_cache: bool,
    /// `Some` if the last thing recorded for this key was a still-outstanding lease; the
    /// duration remaining on it, or `None` if it had already expired by the time of replay (in
    /// which case the Action is restored straight to QUEUED).
    pub(crate) lease_remaining: Option<Option<StdDuration>>,
}

/// Folds a flat transition log down into, per instance, the set of Actions that are still live
/// (not `Completed`/`Cancelled`) and each one's final lease state. Order matters: `transitions`
/// must be in the order they were appended.
pub(crate) fn fold_by_instance(
    transitions: Vec<Transition>,
) -> HashMap<InstanceName, HashMap<(ActionDigest, Option<String>), RestoredAction>> {
    let mut by_instance: HashMap<InstanceName, HashMap<(ActionDigest, Option<String>), RestoredAction>> =
        HashMap::new();
    // Operation name -> (instance, key), so a later `Cancelled` (which only carries the operation
    // name, matching `Instance::cancel`'s own signature) can find what it removes.
    let mut operation_index: HashMap<OperationName, (InstanceName, (ActionDigest, Option<String>))> =
        HashMap::new();

    for transition in transitions {
        match transition {
            Transition::Enqueued {
                instance_name,
                operation_name,
                digest_hash_hex,
                digest_size_bytes,
                salt,
                action_request,
                platform_properties,
                do_not_cache,
            } => {
                let Ok(digest) = ActionDigest::new(&digest_hash_hex, digest_size_bytes) else {
                    continue;
                };
                let action_request = ActionRequest::decode(action_request.as_slice())
                    .unwrap_or_default();
                let key = (digest, salt);
                operation_index.insert(operation_name.clone(), (instance_name.clone(), key.clone()));
                by_instance.entry(instance_name).or_default().insert(
                    key,
                    RestoredAction {
                        operation_name,
                        action_request,
                        platform_properties,
                        do_not_cache,
                        lease_remaining: None,
                    },
                );
            }
            Transition::LeaseIssued {
                instance_name,
                digest_hash_hex,
                digest_size_bytes,
                salt,
                deadline_unix_millis,
            }
            | Transition::LeaseRefreshed {
                instance_name,
                digest_hash_hex,
                digest_size_bytes,
                salt,
                deadline_unix_millis,
            } => {
                let Ok(digest) = ActionDigest::new(&digest_hash_hex, digest_size_bytes) else {
                    continue;
                };
                if let Some(action) = by_instance
                    .get_mut(&instance_name)
                    .and_then(|actions| actions.get_mut(&(digest, salt)))
                {
                    action.lease_remaining = Some(remaining_until(deadline_unix_millis));
                }
            }
            Transition::Completed {
                instance_name,
                digest_hash_hex,
                digest_size_bytes,
                salt,
            } => {
                let Ok(digest) = ActionDigest::new(&digest_hash_hex, digest_size_bytes) else {
                    continue;
                };
                if let Some(actions) = by_instance.get_mut(&instance_name) {
                    actions.remove(&(digest, salt));
                }
            }
            Transition::Cancelled {
                instance_name,
                operation_name,
            } => {
                if let Some((instance_name, key)) = operation_index.remove(&operation_name) {
                    if let Some(actions) = by_instance.get_mut(&instance_name) {
                        actions.remove(&key);
                    }
                }
            }
            Transition::Requeued {
                instance_name,
                digest_hash_hex,
                digest_size_bytes,
                salt,
            } => {
                let Ok(digest) = ActionDigest::new(&digest_hash_hex, digest_size_bytes) else {
                    continue;
                };
                if let Some(action) = by_instance
                    .get_mut(&instance_name)
                    .and_then(|actions| actions.get_mut(&(digest, salt)))
                {
                    action.lease_remaining = None;
                }
            }
        }
    }

    by_instance
}
