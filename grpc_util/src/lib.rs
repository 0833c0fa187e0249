// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

pub mod auth;
pub mod backend;
pub mod hyper;
pub mod infra;
pub mod logging;
pub mod retry;
pub mod secrets;
pub mod sentry;
pub mod services;
