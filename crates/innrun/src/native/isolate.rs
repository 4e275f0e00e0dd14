//! # Isolate, boundary side
//!
//! One guest execution context behind a handle: its engine instance, its
//! capability table, and the loader it was wired with at construction. The
//! engine instance sits behind an async mutex so execute, module evaluation
//! and the completion wait serialize against each other while other handles
//! progress independently.

use std::sync::Arc;

use innwire::Empty;
use innwire::OpError;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::engine::CapabilityTable;
use crate::engine::GuestConfig;
use crate::engine::GuestEngine;
use crate::engine::GuestInstance;
use crate::engine::ModuleProvider;
use crate::ops::OpTableBuilder;
use crate::registry::ResourceTable;
use crate::registry::Rid;

use super::dispatch::DispatcherResource;
use super::loader::LoaderResource;
use super::loader::ModuleStore;
use super::loader::StoreBackedProvider;
use super::snapshot::SnapshotResource;
use super::support;
use super::support::OpResult;
use super::support::RidResponse;

pub(crate) struct IsolateResource {
    instance: Mutex<Box<dyn GuestInstance>>,
    caps: Arc<CapabilityTable>,
    loader: Option<Arc<dyn ModuleProvider>>,
    will_snapshot: bool,
}

#[derive(Deserialize)]
struct NewIsolateRequest {
    will_snapshot: bool,
    #[serde(default)]
    snapshot_rid: Option<Rid>,
    #[serde(default)]
    loader_rid: Option<Rid>,
}

#[derive(Deserialize)]
struct RegisterOpRequest {
    rid: Rid,
    #[serde(rename = "dispatcherRid")]
    dispatcher_rid: Rid,
    name: String,
}

#[derive(Deserialize)]
struct ExecuteRequest {
    rid: Rid,
    source: String,
    filename: String,
}

#[derive(Deserialize)]
struct ExecuteModuleRequest {
    rid: Rid,
    module_specifier: String,
    #[serde(default)]
    loader_rid: Option<Rid>,
    #[serde(default)]
    module_store_rid: Option<Rid>,
}

#[derive(Deserialize)]
struct IsolateRequest {
    rid: Rid,
}

pub(crate) fn install(
    builder: OpTableBuilder,
    resources: &Arc<ResourceTable>,
    engine: &Arc<dyn GuestEngine>,
) -> OpTableBuilder {
    let new_isolate = {
        let resources = resources.clone();
        let engine = engine.clone();
        move |payload: &[u8], _zero_copy: Option<&[u8]>| {
            support::finish(op_new_isolate(&resources, &engine, payload))
        }
    };

    builder
        .register("new_isolate", new_isolate)
        .register("isolate_register_op", support::table_op(resources, op_register_op))
        .register("isolate_execute", support::table_op(resources, op_execute))
        .register("isolate_execute_module", support::table_op(resources, op_execute_module))
        .register("isolate_is_complete", support::table_op(resources, op_is_complete))
        .register("isolate_snapshot", support::table_op(resources, op_snapshot))
}

fn op_new_isolate(
    resources: &Arc<ResourceTable>,
    engine: &Arc<dyn GuestEngine>,
    payload: &[u8],
) -> OpResult {
    let request: NewIsolateRequest = support::parse_request(payload)?;

    let snapshot = match request.snapshot_rid {
        Some(rid) => Some(resources.get::<SnapshotResource>(rid)?.0.clone()),
        None => None,
    };
    let loader = match request.loader_rid {
        Some(rid) => Some(resources.get::<LoaderResource>(rid)?.0.clone()),
        None => None,
    };

    let caps = Arc::new(CapabilityTable::new());
    let config = GuestConfig { will_snapshot: request.will_snapshot, snapshot };
    let instance = engine
        .instantiate(config, caps.clone())
        .map_err(|e| OpError::new(format!("failed to create execution context: {e:#}")))?;

    let rid = resources.insert(Arc::new(IsolateResource {
        instance: Mutex::new(instance),
        caps,
        loader,
        will_snapshot: request.will_snapshot,
    }));
    tracing::debug!(%rid, will_snapshot = request.will_snapshot, "created isolate");
    Ok(support::sync_ok(RidResponse { rid }))
}

fn op_register_op(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request: RegisterOpRequest = support::parse_request(payload)?;
    let isolate = resources.get::<IsolateResource>(request.rid)?;
    let dispatcher = resources.get::<DispatcherResource>(request.dispatcher_rid)?;

    let op_id = isolate.caps.bind(&request.name, dispatcher.0.clone());
    tracing::debug!(rid = %request.rid, name = %request.name, op_id, "registered op");
    Ok(support::sync_ok(Empty {}))
}

// The execute/is_complete family is async; failures discovered before
// suspending still travel the deferred path so callers always see an
// envelope error rather than a channel-type mismatch.
fn op_execute(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request = support::parse_request::<ExecuteRequest>(payload);
    let resources = resources.clone();

    Ok(support::async_op(async move {
        let request = request?;
        let isolate = resources.get::<IsolateResource>(request.rid)?;
        let mut instance = isolate.instance.lock().await;
        instance
            .evaluate(&request.filename, &request.source)
            .await
            .map_err(|e| OpError::new(format!("{e:#}")))?;
        Ok(support::ok_bytes(Empty {}))
    }))
}

fn op_execute_module(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request = support::parse_request::<ExecuteModuleRequest>(payload);
    let resources = resources.clone();

    Ok(support::async_op(async move {
        let request = request?;
        let isolate = resources.get::<IsolateResource>(request.rid)?;

        // A loader named in the request overrides the one wired at construction.
        let base = match request.loader_rid {
            Some(rid) => Some(resources.get::<LoaderResource>(rid)?.0.clone()),
            None => isolate.loader.clone(),
        };
        let base = base.ok_or_else(|| {
            OpError::new(format!("isolate {} has no module loader", request.rid))
        })?;
        let provider: Arc<dyn ModuleProvider> = match request.module_store_rid {
            Some(rid) => {
                let store = resources.get::<ModuleStore>(rid)?;
                Arc::new(StoreBackedProvider { store, inner: base })
            }
            None => base,
        };

        let mut instance = isolate.instance.lock().await;
        instance
            .evaluate_module(&request.module_specifier, provider)
            .await
            .map_err(|e| OpError::new(format!("{e:#}")))?;
        Ok(support::ok_bytes(Empty {}))
    }))
}

fn op_is_complete(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request = support::parse_request::<IsolateRequest>(payload);
    let resources = resources.clone();

    Ok(support::async_op(async move {
        let isolate = resources.get::<IsolateResource>(request?.rid)?;
        let mut instance = isolate.instance.lock().await;
        instance.drain().await.map_err(|e| OpError::new(format!("{e:#}")))?;
        Ok(support::ok_bytes(Empty {}))
    }))
}

fn op_snapshot(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request: IsolateRequest = support::parse_request(payload)?;
    let isolate = resources.get::<IsolateResource>(request.rid)?;

    if !isolate.will_snapshot {
        return Err(OpError::new(format!(
            "isolate {} was not created with will_snapshot",
            request.rid
        )));
    }

    let mut instance = isolate
        .instance
        .try_lock()
        .map_err(|_| OpError::new(format!("isolate {} is busy", request.rid)))?;
    let data = instance
        .snapshot()
        .map_err(|e| OpError::new(format!("{e:#}")))?;

    let rid = resources.insert(Arc::new(SnapshotResource(Arc::new(data))));
    Ok(support::sync_ok(RidResponse { rid }))
}
