// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use digest::Digest;
use protos::build::bazel::remote::execution::v2::{Action as ActionRequest, ActionResult};
use protos::google::devtools::remoteworkers::v1test2::{
    device, BotSession, Device, Lease, LeaseState, Worker,
};
use tokio::time::{sleep, timeout_at, Duration, Instant};

use crate::any_proto_encode;
use crate::server::{
    ActionStatus, Instance, Instances, NullResultPublisher, SchedulerConfig, SchedulingPolicy,
    TenantQuota,
};

async fn execute(instance: &Instance, action_request: ActionRequest) -> ActionResult {
    execute_with(instance, action_request, Vec::new(), false, false).await
}

async fn execute_with(
    instance: &Instance,
    action_request: ActionRequest,
    platform_properties: Vec<(String, String)>,
    do_not_cache: bool,
    skip_cache_lookup: bool,
) -> ActionResult {
    let (_, mut receiver) = instance.execute(
        Digest::EMPTY,
        action_request,
        platform_properties,
        do_not_cache,
        skip_cache_lookup,
    );
    await_completion(&mut receiver).await.unwrap()
}

async fn await_completion(
    receiver: &mut tokio::sync::watch::Receiver<ActionStatus>,
) -> Result<ActionResult, tonic::Status> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match &*receiver.borrow() {
            ActionStatus::Running(_) => {}
            ActionStatus::Completed(res) => return res.clone(),
        }

        timeout_at(deadline, receiver.changed())
            .await
            .unwrap()
            .unwrap();
    }
}

fn complete_lease(lease: &mut Lease) {
    lease.result = Some(any_proto_encode(&ActionResult::default()));
    lease.state = LeaseState::Completed as i32;
    lease.status = Some(protos::google::rpc::Status {
        code: protos::google::rpc::Code::Ok as i32,
        ..Default::default()
    });
}

fn worker_session(name: &str, properties: Vec<(&str, &str)>) -> BotSession {
    BotSession {
        name: name.to_owned(),
        worker: Some(Worker {
            devices: vec![Device {
                properties: properties
                    .into_iter()
                    .map(|(key, value)| device::Property {
                        key: key.to_owned(),
                        value: value.to_owned(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_basic() {
    let instance = Instance::new("test".to_owned(), Duration::from_secs(60));

    // Spawn a worker that will execute the job.
    let instance2 = instance.clone();
    let worker = tokio::spawn(async move {
        let mut session = BotSession::default();

        // Wait for one job to arrive.
        instance2.poll(&mut session, Duration::from_secs(10)).await;
        assert_eq!(session.leases.len(), 1);

        // Then complete it.
        for lease in &mut session.leases {
            complete_lease(lease)
        }
        instance2
            .poll(&mut session, Duration::from_millis(10))
            .await;
    });

    // Then submit a job, and confirm that it completes.
    let _result = execute(&instance, ActionRequest::default()).await;

    worker.await.unwrap();
}

#[tokio::test]
async fn test_worker_expiration() {
    let expiration_timeout = Duration::from_secs(3);
    let instance = Instance::new("test".to_owned(), expiration_timeout);

    // Spawn a worker that will take a job with one session. Then, confirm that it takes longer
    // than the timeout for the work to be assigned to a second session.
    let instance2 = instance.clone();
    let worker = tokio::spawn(async move {
        let mut session = BotSession::default();
        session.name = "one".to_owned();

        // Wait for a job to arrive, but do not actually poll again on the session.
        instance2.poll(&mut session, Duration::from_secs(10)).await;
        assert_eq!(session.leases.len(), 1);

        // Then, wait a while, and poll in a new session.
        sleep(Duration::from_secs(1)).await;
        let mut session = BotSession::default();
        session.name = "two".to_owned();

        // Confirm that it takes some time for the job to be re-assigned, since the first
        // worker's session must expire before its lease is dropped and requeued.
        let poll_began = Instant::now();
        instance2.poll(&mut session, Duration::from_secs(6)).await;
        assert_eq!(session.leases.len(), 1);
        assert!(poll_began.elapsed() > Duration::from_secs(1));

        // Then complete it in the new session.
        for lease in &mut session.leases {
            complete_lease(lease)
        }
        instance2
            .poll(&mut session, Duration::from_millis(10))
            .await;
    });

    // Then submit a job, and confirm that it completes.
    let _result = execute(&instance, ActionRequest::default()).await;

    worker.await.unwrap();
}

#[tokio::test]
async fn test_action_cancellation() {
    let instance = Instance::new("test".to_owned(), Duration::from_secs(60));

    // Spawn a worker that will take a job, then sleep briefly and confirm that it has been
    // marked CANCELLED on its next poll. The worker then acknowledges by reporting the lease
    // back as CANCELLED, which should make it disappear from the session.
    let instance2 = instance.clone();
    let worker = tokio::spawn(async move {
        let mut session = BotSession::default();

        // Wait for a job to arrive.
        instance2.poll(&mut session, Duration::from_secs(10)).await;
        assert_eq!(session.leases.len(), 1);

        // Wait a while, and poll again to confirm that it has been marked cancelled, and that it
        // took a lot less than our poll timeout to return.
        sleep(Duration::from_secs(1)).await;
        let poll_timeout = Duration::from_secs(6);
        let poll_started = Instant::now();
        instance2.poll(&mut session, poll_timeout).await;
        assert_eq!(session.leases.len(), 1);
        assert_eq!(session.leases[0].state, LeaseState::Cancelled as i32);
        assert!(poll_started.elapsed() < (poll_timeout / 4));

        // Acknowledge the cancellation, and confirm it is removed from the session.
        for lease in &mut session.leases {
            lease.state = LeaseState::Cancelled as i32;
        }
        instance2
            .poll(&mut session, Duration::from_millis(10))
            .await;
        assert_eq!(session.leases.len(), 0);
    });

    // Submit a job, but then cancel it shortly afterward.
    let (operation_name, _) = instance.execute(
        Digest::EMPTY,
        ActionRequest::default(),
        Vec::new(),
        false,
        false,
    );
    sleep(Duration::from_secs(1)).await;
    instance.cancel(operation_name);

    worker.await.unwrap();
}

#[tokio::test]
async fn test_cancellation_grace_force_expiry() {
    let config = SchedulerConfig {
        cancellation_grace: Duration::from_millis(200),
        ..SchedulerConfig::default()
    };
    let instance = Instance::with_config("test".to_owned(), Duration::from_secs(60), config);

    // Spawn a worker that takes a job, then never acknowledges the subsequent cancellation.
    let instance2 = instance.clone();
    let worker = tokio::spawn(async move {
        let mut session = BotSession::default();

        instance2.poll(&mut session, Duration::from_secs(10)).await;
        assert_eq!(session.leases.len(), 1);

        sleep(Duration::from_secs(1)).await;

        // First poll after cancellation: lease is offered back as CANCELLED, but not yet removed.
        instance2
            .poll(&mut session, Duration::from_millis(10))
            .await;
        assert_eq!(session.leases.len(), 1);

        // Never acknowledge; wait past the grace period and poll again.
        sleep(Duration::from_millis(400)).await;
        instance2
            .poll(&mut session, Duration::from_millis(10))
            .await;
        assert_eq!(session.leases.len(), 0);
    });

    let (operation_name, _) = instance.execute(
        Digest::EMPTY,
        ActionRequest::default(),
        Vec::new(),
        false,
        false,
    );
    sleep(Duration::from_secs(1)).await;
    instance.cancel(operation_name);

    worker.await.unwrap();
}

#[tokio::test]
async fn test_platform_properties_gate_assignment() {
    let instance = Instance::new("test".to_owned(), Duration::from_secs(60));

    // A worker advertising the wrong property never receives the lease.
    let instance2 = instance.clone();
    let mismatched_worker = tokio::spawn(async move {
        let mut session = worker_session("mismatched", vec![("os", "macos")]);
        instance2
            .poll(&mut session, Duration::from_millis(200))
            .await;
        assert_eq!(session.leases.len(), 0);
    });
    mismatched_worker.await.unwrap();

    // A worker advertising the required property receives and completes it.
    let instance2 = instance.clone();
    let matched_worker = tokio::spawn(async move {
        let mut session = worker_session("matched", vec![("os", "linux")]);
        instance2.poll(&mut session, Duration::from_secs(10)).await;
        assert_eq!(session.leases.len(), 1);
        for lease in &mut session.leases {
            complete_lease(lease)
        }
        instance2
            .poll(&mut session, Duration::from_millis(10))
            .await;
    });

    let _result = execute_with(
        &instance,
        ActionRequest::default(),
        vec![("os".to_owned(), "linux".to_owned())],
        false,
        false,
    )
    .await;

    matched_worker.await.unwrap();
}

#[tokio::test]
async fn test_do_not_cache_skips_merge() {
    let instance = Instance::new("test".to_owned(), Duration::from_secs(60));

    // Two `do_not_cache` executions of the same (empty) digest must be tracked as distinct
    // Operations, each getting its own lease, rather than merging into one.
    let (_, mut receiver_a) = instance.execute(
        Digest::EMPTY,
        ActionRequest::default(),
        Vec::new(),
        true,
        false,
    );
    let (_, mut receiver_b) = instance.execute(
        Digest::EMPTY,
        ActionRequest::default(),
        Vec::new(),
        true,
        false,
    );

    let instance2 = instance.clone();
    let worker = tokio::spawn(async move {
        let mut session = BotSession::default();
        // Both leases are queued independently; with capacity 1 the worker picks them up one at
        // a time.
        for _ in 0..2 {
            instance2.poll(&mut session, Duration::from_secs(10)).await;
            assert_eq!(session.leases.len(), 1);
            for lease in &mut session.leases {
                complete_lease(lease)
            }
            instance2
                .poll(&mut session, Duration::from_millis(10))
                .await;
        }
    });

    assert!(await_completion(&mut receiver_a).await.is_ok());
    assert!(await_completion(&mut receiver_b).await.is_ok());

    worker.await.unwrap();
}

#[tokio::test]
async fn test_retry_budget_exhausted_is_terminal() {
    let config = SchedulerConfig {
        max_attempts: 2,
        ..SchedulerConfig::default()
    };
    let expiration_timeout = Duration::from_millis(200);
    let instance = Instance::with_config("test".to_owned(), expiration_timeout, config);

    let (_, mut receiver) = instance.execute(
        Digest::EMPTY,
        ActionRequest::default(),
        Vec::new(),
        false,
        false,
    );

    // Each iteration: a fresh worker session picks up the (re)queued lease but then goes silent,
    // so its session eventually expires and the lease is dropped, consuming one retry attempt.
    for i in 0..2 {
        let mut session = BotSession::default();
        session.name = format!("worker-{i}");
        instance.poll(&mut session, Duration::from_secs(10)).await;
        assert_eq!(session.leases.len(), 1);
        sleep(expiration_timeout * 3).await;
    }

    let result = await_completion(&mut receiver).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_session_cap_degrades_instead_of_failing() {
    let instance = Instance::new("test".to_owned(), Duration::from_secs(60));
    instance.set_tenant_quota(TenantQuota {
        max_concurrent: None,
        max_execute_rps: None,
        max_sessions: Some(1),
    });

    // The first session is admitted normally.
    let mut first = worker_session("first", Vec::new());
    instance
        .poll(&mut first, Duration::from_millis(10))
        .await;

    // A second, concurrent session is over the cap: it is handed back empty-capacity, so even a
    // queued Action never gets leased to it.
    let (_operation_name, _receiver) =
        instance.execute(Digest::EMPTY, ActionRequest::default(), Vec::new(), false, false);

    let mut second = worker_session("second", Vec::new());
    instance
        .poll(&mut second, Duration::from_millis(50))
        .await;
    assert_eq!(second.leases.len(), 0);

    // But the first (already-admitted) session still receives the lease.
    instance
        .poll(&mut first, Duration::from_secs(10))
        .await;
    assert_eq!(first.leases.len(), 1);
}

#[tokio::test]
async fn test_strict_priority_policy_prefers_higher_priority() {
    let config = SchedulerConfig {
        scheduling_policy: SchedulingPolicy::StrictPriority,
        ..SchedulerConfig::default()
    };
    let instance = Instance::with_config("test".to_owned(), Duration::from_secs(60), config);

    // Enqueue a low-priority Action first, then a high-priority one.
    let (_low_name, mut low_receiver) = instance.execute(
        Digest::EMPTY,
        ActionRequest::default(),
        vec![("priority".to_owned(), "1".to_owned())],
        true,
        true,
    );
    let (_high_name, mut high_receiver) = instance.execute(
        Digest::EMPTY,
        ActionRequest::default(),
        vec![("priority".to_owned(), "10".to_owned())],
        true,
        true,
    );

    // A worker that only has capacity for one lease at a time should be offered the
    // higher-priority Action first, despite it having been queued second.
    let mut session = BotSession::default();
    instance.poll(&mut session, Duration::from_secs(10)).await;
    assert_eq!(session.leases.len(), 1);

    let high_status = high_receiver.borrow().clone();
    assert!(matches!(high_status, ActionStatus::Running(meta) if meta.stage == protos::build::bazel::remote::execution::v2::execution_stage::Value::Executing as i32));
    let low_status = low_receiver.borrow().clone();
    assert!(matches!(low_status, ActionStatus::Running(meta) if meta.stage == protos::build::bazel::remote::execution::v2::execution_stage::Value::Queued as i32));

    for lease in &mut session.leases {
        complete_lease(lease)
    }
    instance.poll(&mut session, Duration::from_millis(10)).await;
    assert!(await_completion(&mut high_receiver).await.is_ok());
}
