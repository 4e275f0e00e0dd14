//! # Snapshot, boundary side
//!
//! A snapshot is an opaque blob behind a handle. Its internal layout belongs
//! to the engine; the registry only stores and replays the bytes.

use std::sync::Arc;

use innwire::OpError;
use serde::Deserialize;
use serde::Serialize;

use crate::ops::OpTableBuilder;
use crate::registry::ResourceTable;
use crate::registry::Rid;

use super::support;
use super::support::OpResult;
use super::support::RidResponse;

pub(crate) struct SnapshotResource(pub(crate) Arc<Vec<u8>>);

#[derive(Deserialize)]
struct SnapshotReadRequest {
    rid: Rid,
}

#[derive(Serialize)]
struct SnapshotReadResponse<'a> {
    data: &'a [u8],
}

pub(crate) fn install(builder: OpTableBuilder, resources: &Arc<ResourceTable>) -> OpTableBuilder {
    builder
        .register("new_snapshot", support::table_op(resources, op_new_snapshot))
        .register("snapshot_read", support::table_op(resources, op_snapshot_read))
}

fn op_new_snapshot(
    resources: &Arc<ResourceTable>,
    _payload: &[u8],
    zero_copy: Option<&[u8]>,
) -> OpResult {
    let data = zero_copy
        .ok_or_else(|| OpError::new("new_snapshot requires a data buffer"))?;
    let rid = resources.insert(Arc::new(SnapshotResource(Arc::new(data.to_vec()))));
    Ok(support::sync_ok(RidResponse { rid }))
}

fn op_snapshot_read(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request: SnapshotReadRequest = support::parse_request(payload)?;
    let snapshot = resources.get::<SnapshotResource>(request.rid)?;
    Ok(support::sync_ok(SnapshotReadResponse { data: &snapshot.0 }))
}
