// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use futures::Future;
use rand::{thread_rng, Rng};

const INTERVAL_DURATION: Duration = Duration::from_millis(10);
const MAX_RETRIES: u32 = 3;
const MAX_BACKOFF_DURATION: Duration = Duration::from_secs(5);

/// Retries a fallible operation using exponential back-off with jitter to delay between
/// attempts. `is_retryable` is consulted on each failure (and is expected to log/record metrics
/// as a side effect, since this is the only place a caller sees every individual failure, not
/// just the last one); once it returns `false` the error is returned immediately.
pub async fn retry_call<T, E, C, F, Fut, R>(client: C, f: F, mut is_retryable: R) -> Result<T, E>
where
    C: Clone,
    F: Fn(C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let mut last_error: Option<E> = None;

    let mut num_retries = 0;
    while num_retries < MAX_RETRIES {
        // Delay before the next attempt if this is a retry.
        if num_retries > 0 {
            let multiplier = thread_rng().gen_range(0..2_u32.pow(num_retries) + 1);
            let sleep_time = INTERVAL_DURATION * multiplier;
            let sleep_time = sleep_time.min(MAX_BACKOFF_DURATION);
            tokio::time::sleep(sleep_time).await;
        }

        let client2 = client.clone();
        match f(client2).await {
            Ok(r) => return Ok(r),
            Err(err) => {
                if is_retryable(&err) {
                    last_error = Some(err);
                } else {
                    return Err(err);
                }
            }
        }

        num_retries += 1;
    }

    Err(last_error.take().unwrap())
}
