// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

mod server;
pub use server::{
    BackendTimeoutsConfig, InstanceConfig, InstanceName, ListenAddressConfig, ProxyServer,
};
