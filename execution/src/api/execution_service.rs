// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;

use digest::{required_digest, Digest};
use futures::Stream;
use prost::Message;
use protos::build::bazel::remote::execution::v2::{
    execution_server::Execution, Action as ActionRequest, ActionResult, BatchReadBlobsRequest,
    ExecuteRequest, ExecuteResponse, GetActionResultRequest, WaitExecutionRequest,
};
use protos::google::longrunning::{operation, Operation};
use tokio::sync::watch;
use tonic::{Code, Request, Response, Status};

use execution_util::{
    generate_operation_name, instance_name_from_operation_name, InstanceName, OperationName,
};

use crate::any_proto_encode;
use crate::api::ExecutionServer;
use crate::server::ActionStatus;

type OperationStream = Pin<Box<dyn Stream<Item = Result<Operation, Status>> + Send + Sync>>;

#[tonic::async_trait]
impl Execution for ExecutionServer {
    type ExecuteStream = OperationStream;

    #[tracing::instrument(skip_all, fields(opentelemetry = true))]
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let request = request.into_inner();
        let instance = self.instances.instance(request.instance_name.clone());

        if !instance.try_admit_execute() {
            return Err(Status::resource_exhausted(
                "tenant Execute rate limit exceeded",
            ));
        }

        let action_digest = required_digest("action_digest", request.action_digest)
            .map_err(Status::invalid_argument)?;

        if !request.skip_cache_lookup {
            if let Some(action_result) = self
                .lookup_action_result(request.instance_name.clone(), action_digest)
                .await?
            {
                return Ok(Response::new(immediately_completed_stream(
                    generate_operation_name(&request.instance_name),
                    action_result,
                )));
            }
        }

        let action = self
            .load_action(request.instance_name, action_digest)
            .await?;
        let do_not_cache = action.do_not_cache;
        let platform_properties = action
            .platform
            .as_ref()
            .map(|platform| {
                platform
                    .properties
                    .iter()
                    .map(|property| (property.name.clone(), property.value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let (operation_name, receiver) = instance.execute(
            action_digest,
            action,
            platform_properties,
            do_not_cache,
            request.skip_cache_lookup,
        );

        Ok(Response::new(stream_from_receiver(
            operation_name,
            receiver,
        )))
    }

    type WaitExecutionStream = OperationStream;

    #[tracing::instrument(skip_all, fields(opentelemetry = true))]
    async fn wait_execution(
        &self,
        request: Request<WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        let operation_name = request.into_inner().name;
        let instance_name =
            instance_name_from_operation_name(&operation_name).map_err(Status::invalid_argument)?;

        let receiver = self
            .instances
            .instance(instance_name)
            .wait(&operation_name)
            .ok_or_else(|| {
                Status::not_found(format!("no known operation named {operation_name}"))
            })?;

        Ok(Response::new(stream_from_receiver(
            operation_name,
            receiver,
        )))
    }
}

impl ExecutionServer {
    /// Looks up a cached result for an Action: a hit short-circuits scheduling entirely and the
    /// caller streams back an already-`done` Operation. `NotFound` is treated as a miss; any
    /// other error is propagated (so e.g. a transient AC outage surfaces rather than silently
    /// forcing re-execution of every Action).
    async fn lookup_action_result(
        &self,
        instance_name: InstanceName,
        action_digest: Digest,
    ) -> Result<Option<ActionResult>, Status> {
        let request = GetActionResultRequest {
            instance_name,
            action_digest: Some(action_digest.into()),
            ..GetActionResultRequest::default()
        };
        match self
            .action_cache_client
            .clone()
            .get_action_result(request)
            .await
        {
            Ok(response) => Ok(Some(response.into_inner())),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status),
        }
    }

    // TODO: Add retry.
    async fn load_action(
        &self,
        instance_name: InstanceName,
        action_digest: Digest,
    ) -> Result<ActionRequest, Status> {
        let mut responses = self
            .cas_client
            .clone()
            .batch_read_blobs(BatchReadBlobsRequest {
                instance_name,
                digests: vec![action_digest.into()],
            })
            .await?
            .into_inner();

        let Some(response) = responses.responses.pop() else {
            return Err(Status::internal(format!("Wrong number of responses: {}", responses.responses.len())));
        };

        match response.status {
            Some(status) if status.code != Code::Ok as i32 => {
                return Err(Status::new(Code::from_i32(status.code), status.message))
            }
            None => return Err(Status::internal("No status on read result.")),
            _ => (),
        }

        ActionRequest::decode(response.data)
            .map_err(|e| Status::internal(format!("Could not decode action: {e}")))
    }
}

/// Produces a single-item, already-`done` Operation stream for a cache hit -- the scheduler is
/// never consulted.
fn immediately_completed_stream(name: OperationName, result: ActionResult) -> OperationStream {
    let stream = async_stream::stream! {
        yield Ok(Operation {
            name,
            done: true,
            result: Some(operation::Result::Response(any_proto_encode(&ExecuteResponse {
                result: Some(result),
                cached_result: true,
                status: Some(protos::google::rpc::Status {
                    code: Code::Ok as i32,
                    ..Default::default()
                }),
                ..Default::default()
            }))),
            ..Default::default()
        });
    };
    Box::pin(stream)
}

fn stream_from_receiver(
    name: OperationName,
    mut receiver: watch::Receiver<ActionStatus>,
) -> OperationStream {
    let stream = async_stream::stream! {
      let item = loop {
          let value = (*receiver.borrow()).clone();
          match value {
            ActionStatus::Running(eom) => {
              yield Ok(Operation {
                name: name.clone(),
                done: false,
                metadata: Some(any_proto_encode(&eom)),
                ..Default::default()
              });
            },
            ActionStatus::Completed(item) => break Some(item),
          }

          if let Err(_recv_error) = receiver.changed().await {
            break None
          }
      };

      let (status, result) = match item {
        Some(Ok(action_result)) => {
          let status = protos::google::rpc::Status {
            code: Code::Ok as i32,
            ..Default::default()
          };
          (status, Some(action_result))
        }
        Some(Err(status)) => {
          let status = protos::google::rpc::Status {
            code: status.code() as i32,
            message: status.message().to_owned(),
            ..Default::default()
          };
          (status, None)
        }
        None => {
          let status = protos::google::rpc::Status {
            code: Code::Cancelled as i32,
            ..Default::default()
          };
          (status, None)
        }
      };

      yield Ok(Operation {
        name,
        done: true,
        result: Some(
          operation::Result::Response(any_proto_encode(
            &ExecuteResponse {
              result,
              status: Some(status),
              ..Default::default()
            },
          )),
        ),
        ..Default::default()
      });
    };
    Box::pin(stream)
}
