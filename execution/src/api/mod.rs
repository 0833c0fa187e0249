// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod bots_service;
mod capabilities_service;
mod execution_service;
mod operations_service;
mod result_publisher;

use std::io;
use std::path::Path;
use std::sync::Arc;

use ginepro::LoadBalancedChannel;

use protos::build::bazel::remote::execution::v2::action_cache_client::ActionCacheClient;
use protos::build::bazel::remote::execution::v2::content_addressable_storage_client::ContentAddressableStorageClient;

use execution_util::InstanceName;

use crate::server::{Instances, TenantQuota};
use result_publisher::GrpcResultPublisher;

#[derive(Clone)]
pub struct ExecutionServer {
    instances: Instances,
    cas_client: ContentAddressableStorageClient<LoadBalancedChannel>,
    action_cache_client: ActionCacheClient<LoadBalancedChannel>,
}

impl ExecutionServer {
    pub fn new(
        cas_client: ContentAddressableStorageClient<LoadBalancedChannel>,
        action_cache_client: ActionCacheClient<LoadBalancedChannel>,
    ) -> Self {
        let publisher = Arc::new(GrpcResultPublisher::new(
            cas_client.clone(),
            action_cache_client.clone(),
        ));
        Self {
            instances: Instances::with_config_and_publisher(Default::default(), publisher),
            cas_client,
            action_cache_client,
        }
    }

    /// Like `new`, but when `state_store_path` is set, recovers any Actions still in flight from
    /// that WAL (see `crate::server::state_store`) and keeps recording to it going forward.
    pub fn new_with_state_store(
        cas_client: ContentAddressableStorageClient<LoadBalancedChannel>,
        action_cache_client: ActionCacheClient<LoadBalancedChannel>,
        state_store_path: Option<&Path>,
    ) -> io::Result<Self> {
        let publisher = Arc::new(GrpcResultPublisher::new(
            cas_client.clone(),
            action_cache_client.clone(),
        ));
        let instances = match state_store_path {
            Some(path) => Instances::restore(path, Default::default(), publisher)?,
            None => Instances::with_config_and_publisher(Default::default(), publisher),
        };
        Ok(Self {
            instances,
            cas_client,
            action_cache_client,
        })
    }

    pub fn update_gauges(&self) {
        self.instances.update_gauges();
    }

    pub fn set_tenant_quota(&self, instance_name: InstanceName, quota: TenantQuota) {
        self.instances.set_tenant_quota(instance_name, quota);
    }
}
