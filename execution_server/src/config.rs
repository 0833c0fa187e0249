// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use grpc_util::backend::BackendConfig;
use grpc_util::infra::{GrpcConfig, InfraConfig};
use serde::Deserialize;

use execution::server::TenantQuota;
use execution_util::InstanceName;

/// Per-tenant admission limits, keyed by `instance_name`. See `execution::server::TenantQuota`
/// for what each field enforces.
#[derive(Clone, Copy, Deserialize, Debug, Default)]
pub struct TenantQuotaConfig {
    pub max_concurrent: Option<usize>,
    pub max_execute_rps: Option<f64>,
    pub max_sessions: Option<usize>,
}

impl From<TenantQuotaConfig> for TenantQuota {
    fn from(config: TenantQuotaConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_execute_rps: config.max_execute_rps,
            max_sessions: config.max_sessions,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// IP address on which to listen for connections.
    pub listen_address: String,

    /// Admin endpoints configuration.
    pub infra: Option<InfraConfig>,

    /// gRPC configuration.
    pub grpc: Option<GrpcConfig>,

    /// Configuration for the connection to the CAS.
    pub cas: BackendConfig,

    /// Configuration for the connection to the Action Cache.
    pub action_cache: BackendConfig,

    /// Per-tenant quotas, keyed by `instance_name`. Tenants with no entry are unconstrained.
    pub tenant_quotas: Option<HashMap<InstanceName, TenantQuotaConfig>>,

    /// Path to the durable write-ahead log. When unset, the scheduler keeps its state purely in
    /// memory, as before: a restart loses every in-flight Action.
    pub state_store_path: Option<PathBuf>,
}

impl FromStr for Config {
    type Err = String;

    fn from_str(raw_config: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}
