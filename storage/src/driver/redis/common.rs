// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Shared plumbing for the Redis-backed storage drivers: the `ConnectionGetter` trait that
//! abstracts over a bare `redis::Client` and the pooled/replica-aware connection managers built
//! on top of it, plus instrumented helpers for issuing a single command or a pipeline.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionLike;
use redis::{Cmd, FromRedisValue, Pipeline, RedisError};

use crate::driver::redis::traits::{
    AsRedisConnectionMut, IdentifyRedisConnection, RedisConnectionName,
};
use crate::driver::StorageError;

/// Obtains a connection (or connection-like handle) to Redis. `read_write` lets backends that
/// distinguish a primary from a read-only replica route the request appropriately.
#[async_trait]
pub trait ConnectionGetter {
    type Connection: AsRedisConnectionMut + ConnectionLike + Send + 'static;

    async fn get_redis_connection(&self, read_write: bool)
        -> Result<Self::Connection, RedisError>;

    /// Checks that this backend is reachable. Used at startup and by readiness probes.
    async fn verify_connection(&self) -> Result<(), String>;
}

fn record_redis_call(cmd_name: &str, driver_label: &str, elapsed: Duration, is_err: bool) {
    metrics::histogram!(
        "toolchain_storage_redis_call_duration_seconds",
        elapsed,
        "cmd" => cmd_name.to_owned(),
        "driver" => driver_label.to_owned(),
    );
    if is_err {
        metrics::counter!(
            "toolchain_storage_redis_call_failed_total",
            1,
            "cmd" => cmd_name.to_owned(),
            "driver" => driver_label.to_owned(),
        );
    }
}

/// Issues a single Redis command against `conn`, recording its duration and whether it failed
/// under metrics tagged with `cmd_name`/`driver_label`.
pub async fn redis_query<C, T>(
    conn: &mut C,
    cmd_name: &str,
    driver_label: &str,
    cmd: &Cmd,
) -> Result<T, StorageError>
where
    C: ConnectionLike + Send,
    T: FromRedisValue,
{
    let start = Instant::now();
    let result = cmd.query_async(conn).await;
    record_redis_call(cmd_name, driver_label, start.elapsed(), result.is_err());
    Ok(result?)
}

/// Issues a Redis pipeline against `conn`, recording its duration and whether it failed under
/// metrics tagged with `cmd_name`/`driver_label`.
pub async fn redis_pipeline<C, T>(
    conn: &mut C,
    cmd_name: &str,
    driver_label: &str,
    pipeline: &Pipeline,
) -> Result<T, StorageError>
where
    C: ConnectionLike + Send,
    T: FromRedisValue,
{
    let start = Instant::now();
    let result = pipeline.query_async(conn).await;
    record_redis_call(cmd_name, driver_label, start.elapsed(), result.is_err());
    Ok(result?)
}

/// Sends a cheap command used purely to check that a connection is alive, tagging the
/// connection with `client_name` for visibility in `CLIENT LIST` on the Redis side.
pub async fn send_info_cmd<C>(conn: &mut C, client_name: &str) -> Result<(), RedisError>
where
    C: ConnectionLike + Send,
{
    redis::cmd("CLIENT")
        .arg("SETNAME")
        .arg(client_name)
        .query_async(conn)
        .await
}

/// Wraps a bare `redis::Client` so it can be used as a `ConnectionGetter`. A bare client has no
/// concept of a read replica, so `read_write` is ignored.
#[derive(Clone)]
pub struct ClientWrapper {
    client: redis::Client,
    name: RedisConnectionName,
}

impl ClientWrapper {
    pub fn new(client: redis::Client, name: RedisConnectionName) -> Self {
        ClientWrapper { client, name }
    }
}

#[async_trait]
impl ConnectionGetter for ClientWrapper {
    type Connection = redis::aio::Connection;

    async fn get_redis_connection(
        &self,
        _read_write: bool,
    ) -> Result<Self::Connection, RedisError> {
        self.client.get_async_connection().await
    }

    async fn verify_connection(&self) -> Result<(), String> {
        let mut conn = self
            .get_redis_connection(false)
            .await
            .map_err(|err| format!("Redis error: {err}"))?;
        send_info_cmd(&mut conn, &self.name.backend)
            .await
            .map_err(|err| format!("Redis error: {err}"))
    }
}

impl IdentifyRedisConnection for ClientWrapper {
    fn identify_redis_connection(&self) -> RedisConnectionName {
        self.name.clone()
    }
}

/// A Redis backend consisting of a primary pool plus an optional read-only replica pool.
///
/// Reads are routed to the replica pool when one is configured, falling back to the primary
/// with probability `use_primary_for_read_only_probability / 1000` (out of a denominator of
/// 1000) so the primary stays warm and absorbs overflow if the replica falls behind. Writes
/// always go to the primary.
#[derive(Clone)]
pub struct RedisBackend<P> {
    name: String,
    primary: P,
    read_only: Option<P>,
    use_primary_for_read_only_probability: usize,
}

impl<P> RedisBackend<P>
where
    P: ConnectionGetter + Clone + Send + Sync + 'static,
{
    pub fn new(
        name: String,
        primary: P,
        read_only: Option<P>,
        use_primary_for_read_only_probability: Option<usize>,
    ) -> Self {
        RedisBackend {
            name,
            primary,
            read_only,
            use_primary_for_read_only_probability: use_primary_for_read_only_probability
                .unwrap_or(0)
                .min(1000),
        }
    }
}

#[async_trait]
impl<P> ConnectionGetter for RedisBackend<P>
where
    P: ConnectionGetter + Clone + Send + Sync + 'static,
{
    type Connection = P::Connection;

    async fn get_redis_connection(
        &self,
        read_write: bool,
    ) -> Result<Self::Connection, RedisError> {
        if read_write {
            return self.primary.get_redis_connection(true).await;
        }
        match &self.read_only {
            Some(read_only) => {
                let use_primary = self.use_primary_for_read_only_probability > 0
                    && rand::thread_rng().gen_range(0..1000)
                        < self.use_primary_for_read_only_probability;
                if use_primary {
                    self.primary.get_redis_connection(false).await
                } else {
                    read_only.get_redis_connection(false).await
                }
            }
            None => self.primary.get_redis_connection(false).await,
        }
    }

    async fn verify_connection(&self) -> Result<(), String> {
        self.primary
            .verify_connection()
            .await
            .map_err(|err| format!("backend `{}` primary: {err}", self.name))?;
        if let Some(read_only) = &self.read_only {
            read_only
                .verify_connection()
                .await
                .map_err(|err| format!("backend `{}` read-only: {err}", self.name))?;
        }
        Ok(())
    }
}
