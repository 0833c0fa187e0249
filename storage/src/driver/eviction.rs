// Copyright 2026 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lasso::{Spur, ThreadedRodeo};
use lru::LruCache;
use parking_lot::Mutex;

use crate::driver::{
    BlobStorage, BoxReadStream, DriverState, Instance, StorageError, StreamingWriteError,
    WriteAttemptOps,
};
use crate::Digest;

type CacheKey = (Spur, Digest);

struct Inner {
    /// Tracks blobs in most-recently-used order, newest at the front. Byte size is the value so
    /// that `total_bytes` can be kept up to date without re-querying the underlying storage.
    lru: LruCache<CacheKey, usize>,
    total_bytes: usize,
    /// Blobs with an open read in flight. These are skipped by eviction even if they are the
    /// least-recently-used entry, since evicting them could cause a client mid-read against a
    /// driver that physically removes content (e.g. a file-backed driver) to see a truncated
    /// read.
    pinned: HashSet<CacheKey>,
}

/// A `BlobStorage` that evicts the least-recently-used blobs once the total size of blobs it has
/// observed exceeds a byte budget.
///
/// This driver only reclaims space in the underlying storage for digests it has itself observed
/// via `find_missing_blobs` or `begin_write_blob`; it does not enumerate the underlying storage
/// on startup. Drivers whose `delete_blob` is a no-op (the default) make this purely a
/// bookkeeping layer: `total_bytes` still reflects what eviction *would* reclaim, which is useful
/// for metrics even when eviction can't act.
pub struct EvictingStorage<S> {
    instance_interns: ThreadedRodeo,
    inner: Arc<Mutex<Inner>>,
    max_total_bytes: usize,
    underlying: S,
}

impl<S> EvictingStorage<S> {
    fn get_key_for_instance(&self, instance: &Instance) -> Spur {
        self.instance_interns.get_or_intern(&instance.name)
    }
}

impl<S> EvictingStorage<S>
where
    S: BlobStorage + Send + Sync + 'static,
{
    pub fn new(max_total_bytes: usize, max_lru_entries: NonZeroUsize, underlying: S) -> Self {
        EvictingStorage {
            instance_interns: ThreadedRodeo::new(),
            inner: Arc::new(Mutex::new(Inner {
                lru: LruCache::new(max_lru_entries),
                total_bytes: 0,
                pinned: HashSet::new(),
            })),
            max_total_bytes,
            underlying,
        }
    }

    /// Record (or touch, if already known) a blob in the LRU, then evict unpinned entries from
    /// the tail until under budget. Returns the digests chosen for eviction so the caller can
    /// issue `delete_blob` calls outside of the lock.
    fn touch_and_collect_evictions(&self, key: CacheKey, size_bytes: usize) -> Vec<CacheKey> {
        let mut inner = self.inner.lock();

        if inner.lru.put(key, size_bytes).is_none() {
            inner.total_bytes += size_bytes;
        }

        let mut evicted = Vec::new();
        while inner.total_bytes > self.max_total_bytes {
            let victim = inner
                .lru
                .iter()
                .rev()
                .find(|(k, _)| !inner.pinned.contains(k))
                .map(|(k, _)| *k);

            let Some(victim) = victim else {
                // Everything still in the LRU is pinned; nothing more can be reclaimed right now.
                break;
            };

            let size = *inner.lru.peek(&victim).unwrap();
            inner.lru.pop(&victim);
            inner.total_bytes -= size;
            evicted.push(victim);
        }

        evicted
    }
}

#[async_trait]
impl<S> BlobStorage for EvictingStorage<S>
where
    S: BlobStorage + Send + Sync + 'static,
{
    async fn find_missing_blobs(
        &self,
        instance: Instance,
        digests: Vec<Digest>,
        state: DriverState,
    ) -> Result<Vec<Digest>, StorageError> {
        let instance_key = self.get_key_for_instance(&instance);
        let missing = self
            .underlying
            .find_missing_blobs(instance.clone(), digests.clone(), state)
            .await?;

        let missing_set: HashSet<Digest> = missing.iter().copied().collect();
        let mut to_evict = Vec::new();
        for digest in digests {
            if missing_set.contains(&digest) {
                continue;
            }
            to_evict.extend(self.touch_and_collect_evictions((instance_key, digest), digest.size_bytes));
        }

        for (key_instance, digest) in to_evict {
            let name = self.instance_interns.resolve(&key_instance).to_owned();
            self.underlying
                .delete_blob(Instance::from(name), digest, DriverState::default())
                .await;
        }

        Ok(missing)
    }

    async fn read_blob(
        &self,
        instance: Instance,
        digest: Digest,
        max_batch_size: usize,
        read_offset: Option<usize>,
        read_limit: Option<usize>,
        state: DriverState,
    ) -> Result<Option<BoxReadStream>, StorageError> {
        let key = (self.get_key_for_instance(&instance), digest);
        {
            let mut inner = self.inner.lock();
            inner.pinned.insert(key);
        }

        let result = self
            .underlying
            .read_blob(instance, digest, max_batch_size, read_offset, read_limit, state)
            .await;

        let mut inner = self.inner.lock();
        inner.pinned.remove(&key);

        result
    }

    async fn begin_write_blob(
        &self,
        instance: Instance,
        digest: Digest,
        state: DriverState,
    ) -> Result<Box<dyn WriteAttemptOps + Send + Sync + 'static>, StreamingWriteError> {
        self.underlying
            .begin_write_blob(instance, digest, state)
            .await
    }

    fn ensure_instance(&mut self, instance: &Instance, state: DriverState) {
        self.underlying.ensure_instance(instance, state)
    }

    async fn delete_blob(&self, instance: Instance, digest: Digest, state: DriverState) {
        let key = (self.get_key_for_instance(&instance), digest);
        {
            let mut inner = self.inner.lock();
            if let Some(size) = inner.lru.pop(&key) {
                inner.total_bytes -= size;
            }
        }
        self.underlying.delete_blob(instance, digest, state).await
    }
}
