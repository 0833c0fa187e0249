// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use ginepro::LoadBalancedChannel;
use tonic::Request;

use execution_util::InstanceName;
use protos::build::bazel::remote::execution::v2::action_cache_client::ActionCacheClient;
use protos::build::bazel::remote::execution::v2::content_addressable_storage_client::ContentAddressableStorageClient;
use protos::build::bazel::remote::execution::v2::{
    ActionResult, Digest as ApiDigest, FindMissingBlobsRequest, UpdateActionResultRequest,
};

use crate::server::{ActionDigest, PublishOutcome, ResultPublisher};

/// Validates a completed `ActionResult` against the CAS, and writes it to the Action Cache,
/// using the same backends the `execution_server` binary already holds clients for. See
/// `crate::server::ResultPublisher` for the rule this implements.
#[derive(Clone)]
pub(crate) struct GrpcResultPublisher {
    cas_client: ContentAddressableStorageClient<LoadBalancedChannel>,
    action_cache_client: ActionCacheClient<LoadBalancedChannel>,
}

impl GrpcResultPublisher {
    pub(crate) fn new(
        cas_client: ContentAddressableStorageClient<LoadBalancedChannel>,
        action_cache_client: ActionCacheClient<LoadBalancedChannel>,
    ) -> Self {
        Self {
            cas_client,
            action_cache_client,
        }
    }

    /// Collects the output digests an `ActionResult` references directly (i.e. without
    /// recursively expanding `Tree` blobs, which the Action Cache service itself re-validates
    /// lazily on read and heals if they've gone missing).
    fn referenced_digests(result: &ActionResult) -> Vec<ApiDigest> {
        let mut digests = Vec::new();
        digests.extend(result.stdout_digest.clone());
        digests.extend(result.stderr_digest.clone());
        digests.extend(result.output_files.iter().filter_map(|f| f.digest.clone()));
        digests.extend(
            result
                .output_directories
                .iter()
                .filter_map(|d| d.tree_digest.clone()),
        );
        digests
    }
}

#[tonic::async_trait]
impl ResultPublisher for GrpcResultPublisher {
    async fn publish(
        &self,
        instance_name: &InstanceName,
        action_digest: ActionDigest,
        do_not_cache: bool,
        result: &ActionResult,
    ) -> PublishOutcome {
        let digests = Self::referenced_digests(result);
        if !digests.is_empty() {
            let request = FindMissingBlobsRequest {
                instance_name: instance_name.clone(),
                blob_digests: digests,
            };
            let missing = match self.cas_client.clone().find_missing_blobs(request).await {
                Ok(response) => response.into_inner().missing_blob_digests,
                Err(status) => {
                    log::warn!(
                        "[{instance_name}] find_missing_blobs failed while validating result for \
                         {action_digest:?}: {status}"
                    );
                    return PublishOutcome::Incomplete;
                }
            };
            if !missing.is_empty() {
                log::info!(
                    "[{instance_name}] result for {action_digest:?} references {} missing blob(s)",
                    missing.len()
                );
                return PublishOutcome::Incomplete;
            }
        }

        if do_not_cache {
            return PublishOutcome::Published;
        }

        let request = UpdateActionResultRequest {
            instance_name: instance_name.clone(),
            action_digest: Some(action_digest.into()),
            action_result: Some(result.clone()),
            ..UpdateActionResultRequest::default()
        };
        if let Err(status) = self
            .action_cache_client
            .clone()
            .update_action_result(Request::new(request))
            .await
        {
            log::warn!(
                "[{instance_name}] failed to write result for {action_digest:?} to the Action \
                 Cache: {status}"
            );
            // The worker already ran the Action; refusing to complete the Operation over an AC
            // write hiccup would waste the work. The result is still returned to the caller --
            // only the cache entry is missing, which a future identical Action will simply redo.
        }

        PublishOutcome::Published
    }
}
