//! # Standard dispatcher, boundary side
//!
//! Turns a guest's dispatch call into a command the host fetches, services
//! and answers. One queue feeds the host's wait op; a pending map correlates
//! cmd_ids back to suspended guest calls. The guest stays parked until the
//! respond op completes its oneshot, so exactly one response reaches each
//! command.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use innwire::Empty;
use innwire::OpError;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::engine::Dispatch;
use crate::ops::OpTableBuilder;
use crate::registry::ResourceTable;
use crate::registry::Rid;

use super::support;
use super::support::OpResult;

/// Engine-facing wrapper holding any dispatch capability.
///
/// The registry stores concrete types, so the trait object gets one level of
/// nesting to live behind a handle.
pub(crate) struct DispatcherResource(pub(crate) Arc<dyn Dispatch>);

/// A guest-originated command awaiting a host response.
struct Command {
    cmd_id: u64,
    data: Vec<u8>,
    zero_copy: Option<Vec<u8>>,
}

pub(crate) struct StdDispatcherState {
    next_cmd_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Vec<u8>>>,
    queue_tx: mpsc::UnboundedSender<Command>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<Command>>,
}

impl StdDispatcherState {
    fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            next_cmd_id: AtomicU64::new(0),
            pending: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }
}

#[async_trait::async_trait]
impl Dispatch for StdDispatcherState {
    async fn dispatch(&self, data: &[u8], zero_copy: Option<&[u8]>) -> anyhow::Result<Vec<u8>> {
        let cmd_id = self.next_cmd_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(cmd_id, tx);
        self.queue_tx
            .send(Command {
                cmd_id,
                data: data.to_vec(),
                zero_copy: zero_copy.map(<[u8]>::to_vec),
            })
            .map_err(|_| anyhow::anyhow!("dispatcher command queue closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("command {cmd_id} was dropped without a response"))
    }
}

#[derive(Serialize)]
struct NewStdDispatcherResponse {
    std_dispatcher_rid: Rid,
    dispatcher_rid: Rid,
}

#[derive(Deserialize)]
struct WaitForDispatchRequest {
    rid: Rid,
}

#[derive(Serialize)]
struct WaitForDispatchResponse {
    cmd_id: u64,
    data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    zero_copy: Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct RespondRequest {
    rid: Rid,
    cmd_id: u64,
}

pub(crate) fn install(builder: OpTableBuilder, resources: &Arc<ResourceTable>) -> OpTableBuilder {
    builder
        .register("new_std_dispatcher", support::table_op(resources, op_new_std_dispatcher))
        .register(
            "std_dispatcher_wait_for_dispatch",
            support::table_op(resources, op_wait_for_dispatch),
        )
        .register("std_dispatcher_respond", support::table_op(resources, op_respond))
}

fn op_new_std_dispatcher(
    resources: &Arc<ResourceTable>,
    _payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let state = Arc::new(StdDispatcherState::new());
    let std_dispatcher_rid = resources.insert(state.clone());
    let dispatcher_rid = resources.insert(Arc::new(DispatcherResource(state)));
    tracing::debug!(%std_dispatcher_rid, %dispatcher_rid, "created std dispatcher");
    Ok(support::sync_ok(NewStdDispatcherResponse { std_dispatcher_rid, dispatcher_rid }))
}

// Async contract: even failures discovered before suspending (bad payload,
// unknown rid) travel the deferred path, so the caller sees an envelope
// error rather than a channel-type mismatch.
fn op_wait_for_dispatch(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request = support::parse_request::<WaitForDispatchRequest>(payload);
    let resources = resources.clone();

    Ok(support::async_op(async move {
        let state = resources.get::<StdDispatcherState>(request?.rid)?;
        let mut queue = state.queue_rx.lock().await;
        let command = queue
            .recv()
            .await
            .ok_or_else(|| OpError::new("dispatcher command queue closed"))?;
        Ok(support::ok_bytes(WaitForDispatchResponse {
            cmd_id: command.cmd_id,
            data: command.data,
            zero_copy: command.zero_copy,
        }))
    }))
}

fn op_respond(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    zero_copy: Option<&[u8]>,
) -> OpResult {
    let request: RespondRequest = support::parse_request(payload)?;
    let state = resources.get::<StdDispatcherState>(request.rid)?;

    let (_, sender) = state.pending.remove(&request.cmd_id).ok_or_else(|| {
        OpError::new(format!("no pending command {} for {}", request.cmd_id, request.rid))
    })?;
    let response = zero_copy
        .ok_or_else(|| OpError::new("respond requires a response buffer"))?;

    if sender.send(response.to_vec()).is_err() {
        tracing::warn!(rid = %request.rid, cmd_id = request.cmd_id, "guest abandoned command");
    }
    Ok(support::sync_ok(Empty {}))
}
