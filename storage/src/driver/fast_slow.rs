// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryFutureExt};

use crate::driver::{
    BlobStorage, DriverState, Instance, SmallBlobStorage, StorageError, StreamingWriteError,
};
use crate::Digest;

/// A `BlobStorage` that tries to read first from a "fast" storage (which is potentially
/// ephemeral), falling back to a "slow" but persistent storage if the "fast" storage did not have
/// the blob.
///
/// This is useful for putting an ephemeral cache in front of a slower persistent storage.
#[derive(Clone)]
pub struct FastSlowReplicationStorage<Fast, Slow> {
    fast_storage: Fast,
    slow_storage: Slow,
}

#[async_trait]
impl<Fast, Slow> SmallBlobStorage for FastSlowReplicationStorage<Fast, Slow>
where
    Fast: SmallBlobStorage + Send + Sync + 'static,
    Slow: BlobStorage + Send + Sync + 'static,
{
    async fn find_missing_blobs(
        &self,
        instance: Instance,
        digests: Vec<Digest>,
        state: DriverState,
    ) -> Result<Vec<Digest>, StorageError> {
        let digests_missing_from_fast = self
            .fast_storage
            .find_missing_blobs(instance.clone(), digests, state.clone())
            .await?;
        let missing_digests = self
            .slow_storage
            .find_missing_blobs(instance, digests_missing_from_fast, state)
            .await?;
        Ok(missing_digests)
    }

    async fn read_blob(
        &self,
        instance: Instance,
        digest: Digest,
        state: DriverState,
    ) -> Result<Option<Bytes>, StorageError> {
        // Check whether the fast storage has the blob.
        match self
            .fast_storage
            .read_blob(instance.clone(), digest, state.clone())
            .await
        {
            Ok(Some(content)) => return Ok(Some(content)),
            Ok(None) => (),
            Err(err) => {
                log::error!("Fast storage returned error: {}", err);
                // TODO: increment metric
            }
        }

        // If missing or on error, query the slow storage for the blob.
        let slow_stream = self
            .slow_storage
            .read_blob(
                instance.clone(),
                digest,
                128 * 1024 * 1024,
                None,
                None,
                state.clone(),
            )
            .await?;

        let mut slow_stream = match slow_stream {
            Some(s) => s,
            None => return Ok(None),
        };

        let mut buffer = BytesMut::with_capacity(digest.size_bytes);
        while let Some(chunk) = slow_stream.next().await {
            let chunk = chunk?;
            if (buffer.capacity() - buffer.len()) < chunk.len() {
                buffer.reserve(chunk.len());
            }
            buffer.extend_from_slice(&chunk[..]);
        }
        let content = buffer.freeze();

        self.fast_storage
            .write_blob(instance, digest, content.clone(), state)
            .await?;
        Ok(Some(content))
    }

    async fn write_blob(
        &self,
        instance: Instance,
        digest: Digest,
        content: Bytes,
        state: DriverState,
    ) -> Result<(), StorageError> {
        // The fast storage cannot complete early with a `StreamingWriteError::AlreadyExists`: only
        // the slow storage can. So we only exit early if the slow storage already has the blob.
        let fast_write = self
            .fast_storage
            .write_blob(instance.clone(), digest, content.clone(), state.clone())
            .map_err(StreamingWriteError::StorageError);
        let slow_write = async move {
            let mut attempt = self
                .slow_storage
                .begin_write_blob(instance, digest, state)
                .await?;
            attempt.write(content).await?;
            attempt.commit().await?;
            Ok(())
        };
        futures::try_join!(fast_write, slow_write)
            .map(|((), ())| ())
            .or_else(StreamingWriteError::ok_if_already_exists)
    }
}

impl<Fast, Slow> FastSlowReplicationStorage<Fast, Slow>
where
    Fast: SmallBlobStorage + Send + Sync + 'static,
    Slow: BlobStorage + Send + Sync + 'static,
{
    /// Create a new `FastSlowReplicationStorage` with the given storage drivers for the
    /// "fast" and "slow" backends.
    pub fn new(fast_storage: Fast, slow_storage: Slow) -> Self {
        Self {
            fast_storage,
            slow_storage,
        }
    }

    /// Consume this `BlobStorage` and return the child fast/slow storage implementations.
    #[cfg(test)]
    pub fn into_inner(self) -> (Fast, Slow) {
        (self.fast_storage, self.slow_storage)
    }

    #[cfg(test)]
    pub fn get_ref(&self) -> (&Fast, &Slow) {
        (&self.fast_storage, &self.slow_storage)
    }
}
