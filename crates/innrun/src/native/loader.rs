//! # Standard loader, boundary side
//!
//! Module resolution and module loading are served by two independent
//! command queues with the same await/respond shape the dispatcher uses, so
//! a resolve and a load for different modules can proceed concurrently.
//! Cmd-id spaces are per queue; the pairing invariant holds within each
//! queue, never across them.

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

use crate::engine::ModuleProvider;
use crate::engine::ModuleSource;
use crate::ops::OpTableBuilder;
use crate::registry::ResourceTable;
use crate::registry::Rid;

use super::support;
use super::support::OpResult;
use super::support::RidResponse;

/// Engine-facing wrapper holding any module provider.
pub(crate) struct LoaderResource(pub(crate) Arc<dyn ModuleProvider>);

struct ResolveCommand {
    cmd_id: u64,
    specifier: String,
    referrer: String,
    is_root: bool,
}

struct LoadCommand {
    cmd_id: u64,
    module_specifier: String,
}

pub(crate) struct StdLoaderState {
    next_resolve_id: AtomicU64,
    resolve_pending: DashMap<u64, oneshot::Sender<String>>,
    resolve_tx: mpsc::UnboundedSender<ResolveCommand>,
    resolve_rx: Mutex<mpsc::UnboundedReceiver<ResolveCommand>>,
    next_load_id: AtomicU64,
    load_pending: DashMap<u64, oneshot::Sender<ModuleSource>>,
    load_tx: mpsc::UnboundedSender<LoadCommand>,
    load_rx: Mutex<mpsc::UnboundedReceiver<LoadCommand>>,
}

impl StdLoaderState {
    fn new() -> Self {
        let (resolve_tx, resolve_rx) = mpsc::unbounded_channel();
        let (load_tx, load_rx) = mpsc::unbounded_channel();
        Self {
            next_resolve_id: AtomicU64::new(0),
            resolve_pending: DashMap::new(),
            resolve_tx,
            resolve_rx: Mutex::new(resolve_rx),
            next_load_id: AtomicU64::new(0),
            load_pending: DashMap::new(),
            load_tx,
            load_rx: Mutex::new(load_rx),
        }
    }
}

#[async_trait::async_trait]
impl ModuleProvider for StdLoaderState {
    async fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        is_root: bool,
    ) -> anyhow::Result<String> {
        let cmd_id = self.next_resolve_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.resolve_pending.insert(cmd_id, tx);
        self.resolve_tx
            .send(ResolveCommand {
                cmd_id,
                specifier: specifier.to_string(),
                referrer: referrer.to_string(),
                is_root,
            })
            .map_err(|_| anyhow::anyhow!("loader resolve queue closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("resolve request {cmd_id} was dropped without a response"))
    }

    async fn load(&self, module_specifier: &str) -> anyhow::Result<ModuleSource> {
        let cmd_id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.load_pending.insert(cmd_id, tx);
        self.load_tx
            .send(LoadCommand { cmd_id, module_specifier: module_specifier.to_string() })
            .map_err(|_| anyhow::anyhow!("loader load queue closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("load request {cmd_id} was dropped without a response"))
    }
}

/// Cache of loaded module sources, shareable across execution contexts.
pub(crate) struct ModuleStore {
    modules: DashMap<String, ModuleSource>,
}

impl ModuleStore {
    fn new() -> Self {
        Self { modules: DashMap::new() }
    }
}

/// Serves loads from a [`ModuleStore`], falling back to the inner provider
/// and remembering what it returns. Resolution always reaches the inner
/// provider; only the load round-trip is elided on a hit.
pub(crate) struct StoreBackedProvider {
    pub(crate) store: Arc<ModuleStore>,
    pub(crate) inner: Arc<dyn ModuleProvider>,
}

#[async_trait::async_trait]
impl ModuleProvider for StoreBackedProvider {
    async fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        is_root: bool,
    ) -> anyhow::Result<String> {
        self.inner.resolve(specifier, referrer, is_root).await
    }

    async fn load(&self, module_specifier: &str) -> anyhow::Result<ModuleSource> {
        if let Some(hit) = self.store.modules.get(module_specifier) {
            return Ok(hit.value().clone());
        }
        let source = self.inner.load(module_specifier).await?;
        self.store.modules.insert(module_specifier.to_string(), source.clone());
        Ok(source)
    }
}

#[derive(Serialize)]
struct NewStdLoaderResponse {
    std_loader_rid: Rid,
    loader_rid: Rid,
}

#[derive(Deserialize)]
struct AwaitRequest {
    rid: Rid,
}

#[derive(Serialize)]
struct AwaitResolveResponse {
    cmd_id: u64,
    specifier: String,
    referrer: String,
    is_root: bool,
}

#[derive(Deserialize)]
struct RespondResolveRequest {
    rid: Rid,
    cmd_id: u64,
    module_specifier: String,
}

#[derive(Serialize)]
struct AwaitLoadResponse {
    cmd_id: u64,
    module_specifier: String,
}

#[derive(Deserialize)]
struct RespondLoadRequest {
    rid: Rid,
    cmd_id: u64,
    module_name: String,
    code: String,
}

pub(crate) fn install(builder: OpTableBuilder, resources: &Arc<ResourceTable>) -> OpTableBuilder {
    builder
        .register("new_std_loader", support::table_op(resources, op_new_std_loader))
        .register("std_loader_await_resolve", support::table_op(resources, op_await_resolve))
        .register("std_loader_respond_resolve", support::table_op(resources, op_respond_resolve))
        .register("std_loader_await_load", support::table_op(resources, op_await_load))
        .register("std_loader_respond_load", support::table_op(resources, op_respond_load))
        .register("new_module_store", support::table_op(resources, op_new_module_store))
}

fn op_new_std_loader(
    resources: &Arc<ResourceTable>,
    _payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let state = Arc::new(StdLoaderState::new());
    let std_loader_rid = resources.insert(state.clone());
    let loader_rid = resources.insert(Arc::new(LoaderResource(state)));
    tracing::debug!(%std_loader_rid, %loader_rid, "created std loader");
    Ok(support::sync_ok(NewStdLoaderResponse { std_loader_rid, loader_rid }))
}

// Async contract: failures discovered before suspending still travel the
// deferred path. Same in op_await_load.
fn op_await_resolve(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request = support::parse_request::<AwaitRequest>(payload);
    let resources = resources.clone();

    Ok(support::async_op(async move {
        let state = resources.get::<StdLoaderState>(request?.rid)?;
        let mut queue = state.resolve_rx.lock().await;
        let command = queue
            .recv()
            .await
            .ok_or_else(|| OpError::new("loader resolve queue closed"))?;
        Ok(support::ok_bytes(AwaitResolveResponse {
            cmd_id: command.cmd_id,
            specifier: command.specifier,
            referrer: command.referrer,
            is_root: command.is_root,
        }))
    }))
}

fn op_respond_resolve(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request: RespondResolveRequest = support::parse_request(payload)?;
    let state = resources.get::<StdLoaderState>(request.rid)?;

    let (_, sender) = state.resolve_pending.remove(&request.cmd_id).ok_or_else(|| {
        OpError::new(format!("no pending resolve {} for {}", request.cmd_id, request.rid))
    })?;
    if sender.send(request.module_specifier).is_err() {
        tracing::warn!(rid = %request.rid, cmd_id = request.cmd_id, "guest abandoned resolve");
    }
    Ok(support::sync_ok(Empty {}))
}

fn op_await_load(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request = support::parse_request::<AwaitRequest>(payload);
    let resources = resources.clone();

    Ok(support::async_op(async move {
        let state = resources.get::<StdLoaderState>(request?.rid)?;
        let mut queue = state.load_rx.lock().await;
        let command = queue
            .recv()
            .await
            .ok_or_else(|| OpError::new("loader load queue closed"))?;
        Ok(support::ok_bytes(AwaitLoadResponse {
            cmd_id: command.cmd_id,
            module_specifier: command.module_specifier,
        }))
    }))
}

fn op_respond_load(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request: RespondLoadRequest = support::parse_request(payload)?;
    let state = resources.get::<StdLoaderState>(request.rid)?;

    let (_, sender) = state.load_pending.remove(&request.cmd_id).ok_or_else(|| {
        OpError::new(format!("no pending load {} for {}", request.cmd_id, request.rid))
    })?;
    let source = ModuleSource { module_name: request.module_name, code: request.code };
    if sender.send(source).is_err() {
        tracing::warn!(rid = %request.rid, cmd_id = request.cmd_id, "guest abandoned load");
    }
    Ok(support::sync_ok(Empty {}))
}

fn op_new_module_store(
    resources: &Arc<ResourceTable>,
    _payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let rid = resources.insert(Arc::new(ModuleStore::new()));
    Ok(support::sync_ok(RidResponse { rid }))
}
