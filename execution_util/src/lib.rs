// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use rand::Rng;
use uuid::Uuid;

pub type OperationName = String;

pub type InstanceName = String;

pub type SessionName = String;

/// NB: See `storage/src/uuid_gen.rs` for the reason for using `rand::thread_rng` here.
pub fn generate_uuid() -> String {
    let mut rng = rand::thread_rng();
    Uuid::from_bytes(rng.gen()).to_string()
}

pub fn generate_session_name(instance_name: &InstanceName) -> SessionName {
    format!("{instance_name}/{}", generate_uuid())
}

pub fn generate_operation_name(instance_name: &InstanceName) -> OperationName {
    format!("{instance_name}/{}", generate_uuid())
}

pub fn instance_name_from_operation_name(name: &OperationName) -> Result<InstanceName, String> {
    let (instance_name, _) = name
        .split_once('/')
        .ok_or_else(|| format!("unable to parse instance from `{name}`"))?;
    Ok(instance_name.to_owned())
}

pub fn instance_name_from_session_name(name: &SessionName) -> Result<InstanceName, String> {
    let (instance_name, _) = name
        .split_once('/')
        .ok_or_else(|| format!("unable to parse instance from `{name}`"))?;
    Ok(instance_name.to_owned())
}

/// A single `name=value` platform constraint, carried by both REAPI's `Platform.properties` and
/// the Bots protocol's `Device.properties`. Kept as an ordered list (rather than a map) since the
/// wire format is a repeated field and duplicate names are permitted.
pub type PlatformProperty = (String, String);

/// True if every property an Action requires is present (by exact `name`/`value` match) among
/// the properties a worker advertises. An empty `required` list is always satisfied.
pub fn platform_properties_satisfied(
    required: &[PlatformProperty],
    available: &[PlatformProperty],
) -> bool {
    required.iter().all(|(name, value)| {
        available
            .iter()
            .any(|(n, v)| n == name && v == value)
    })
}

/// Parses the conventional `priority` platform property (also used by Buildbarn/BuildBuddy to
/// smuggle a scheduling hint through `Platform`, since REAPI has no first-class priority field).
/// Missing or unparseable values default to `0`.
pub fn parse_priority(properties: &[PlatformProperty]) -> i32 {
    properties
        .iter()
        .find(|(name, _)| name == "priority")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0)
}
