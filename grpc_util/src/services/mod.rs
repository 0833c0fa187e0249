// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod grpc_metrics;
pub use grpc_metrics::{convert_status_code, GrpcMetrics};

mod http_metrics;
pub use http_metrics::HttpMetrics;
