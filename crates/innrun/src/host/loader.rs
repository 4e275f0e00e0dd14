//! # Standard loader, host side
//!
//! Two pumps, one per phase: resolution and loading follow the same
//! await/respond shape as the dispatcher but against distinct op pairs, so a
//! resolve and a load for different modules never block each other. The
//! callbacks are fixed at construction; unlike the dispatcher there is no
//! window where a request can arrive unservable.

use innwire::Empty;
use serde::Deserialize;
use serde::Serialize;

use crate::engine::ModuleSource;
use crate::ops;
use crate::ops::OpHandle;
use crate::ops::OpTable;
use crate::registry::Rid;

use super::CallError;
use super::call_async;
use super::call_sync;

#[derive(Debug)]
pub enum Error {
    Call(CallError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call(e) => write!(f, "Call error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<CallError> for Error {
    fn from(e: CallError) -> Self {
        Self::Call(e)
    }
}

impl From<ops::Error> for Error {
    fn from(e: ops::Error) -> Self {
        Self::Call(CallError::Channel(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Anything an isolate can pull module sources through.
pub trait Loader {
    fn rid(&self) -> Rid;
}

#[derive(Deserialize)]
struct NewStdLoaderResponse {
    std_loader_rid: Rid,
    loader_rid: Rid,
}

#[derive(Serialize)]
struct AwaitRequest {
    rid: Rid,
}

#[derive(Deserialize)]
struct AwaitResolveResponse {
    cmd_id: u64,
    specifier: String,
    referrer: String,
    is_root: bool,
}

#[derive(Serialize)]
struct RespondResolveRequest {
    rid: Rid,
    cmd_id: u64,
    module_specifier: String,
}

#[derive(Deserialize)]
struct AwaitLoadResponse {
    cmd_id: u64,
    module_specifier: String,
}

#[derive(Serialize)]
struct RespondLoadRequest {
    rid: Rid,
    cmd_id: u64,
    module_name: String,
    code: String,
}

/// Host handle to a standard loader.
pub struct StdLoader {
    rid: Rid,
    std_rid: Rid,
}

impl StdLoader {
    /// Allocates the loader and starts both pumps. Must be called from
    /// within a tokio runtime.
    pub fn new<R, L>(ops: &OpTable, onresolve: R, onload: L) -> Result<Self>
    where
        R: Fn(&str, &str, bool) -> anyhow::Result<String> + Send + Sync + 'static,
        L: Fn(&str) -> anyhow::Result<ModuleSource> + Send + Sync + 'static,
    {
        let new_op = ops.load("new_std_loader")?;
        let await_resolve = ops.load("std_loader_await_resolve")?;
        let respond_resolve = ops.load("std_loader_respond_resolve")?;
        let await_load = ops.load("std_loader_await_load")?;
        let respond_load = ops.load("std_loader_respond_load")?;

        let response: NewStdLoaderResponse = call_sync(&new_op, &Empty {}, None)?;
        let std_rid = response.std_loader_rid;

        tokio::spawn(async move {
            let error = run_resolve_pump(await_resolve, respond_resolve, std_rid, onresolve).await;
            tracing::error!(rid = %std_rid, error = %error, "loader resolve pump terminated");
        });
        tokio::spawn(async move {
            let error = run_load_pump(await_load, respond_load, std_rid, onload).await;
            tracing::error!(rid = %std_rid, error = %error, "loader load pump terminated");
        });

        Ok(Self { rid: response.loader_rid, std_rid })
    }

    /// Handle of the boundary-side request state (as opposed to the loader
    /// capability handle isolates are wired with).
    pub fn std_rid(&self) -> Rid {
        self.std_rid
    }
}

impl Loader for StdLoader {
    fn rid(&self) -> Rid {
        self.rid
    }
}

/// Host handle to a boundary-side module source cache.
pub struct ModuleStore {
    rid: Rid,
}

impl ModuleStore {
    pub fn new(ops: &OpTable) -> Result<Self> {
        let new_op = ops.load("new_module_store")?;
        #[derive(Deserialize)]
        struct RidResponse {
            rid: Rid,
        }
        let response: RidResponse = call_sync(&new_op, &Empty {}, None)?;
        Ok(Self { rid: response.rid })
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}

async fn run_resolve_pump<R>(
    await_op: OpHandle,
    respond_op: OpHandle,
    rid: Rid,
    onresolve: R,
) -> anyhow::Error
where
    R: Fn(&str, &str, bool) -> anyhow::Result<String> + Send + Sync,
{
    loop {
        let request: AwaitResolveResponse =
            match call_async(&await_op, &AwaitRequest { rid }, None).await {
                Ok(request) => request,
                Err(e) => break e.into(),
            };

        let module_specifier =
            match onresolve(&request.specifier, &request.referrer, request.is_root) {
                Ok(specifier) => specifier,
                Err(e) => {
                    break e.context(format!("onresolve failed for request {}", request.cmd_id));
                }
            };

        let respond = RespondResolveRequest { rid, cmd_id: request.cmd_id, module_specifier };
        if let Err(e) = call_sync::<_, Empty>(&respond_op, &respond, None) {
            break e.into();
        }
    }
}

async fn run_load_pump<L>(
    await_op: OpHandle,
    respond_op: OpHandle,
    rid: Rid,
    onload: L,
) -> anyhow::Error
where
    L: Fn(&str) -> anyhow::Result<ModuleSource> + Send + Sync,
{
    loop {
        let request: AwaitLoadResponse =
            match call_async(&await_op, &AwaitRequest { rid }, None).await {
                Ok(request) => request,
                Err(e) => break e.into(),
            };

        let source = match onload(&request.module_specifier) {
            Ok(source) => source,
            Err(e) => break e.context(format!("onload failed for request {}", request.cmd_id)),
        };

        let respond = RespondLoadRequest {
            rid,
            cmd_id: request.cmd_id,
            module_name: source.module_name,
            code: source.code,
        };
        if let Err(e) = call_sync::<_, Empty>(&respond_op, &respond, None) {
            break e.into();
        }
    }
}
