//! # Isolate, host side
//!
//! One guest execution context: wired with a loader at construction,
//! optionally restored from a snapshot, extended with named capabilities via
//! `register_op`, then driven through execute/execute_module and joined with
//! `run`. Completion is terminal; the wrapper refuses further execution
//! instead of leaving the behavior to chance.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use innwire::Empty;
use serde::Deserialize;
use serde::Serialize;

use crate::ops;
use crate::ops::OpHandle;
use crate::ops::OpTable;
use crate::registry::Rid;

use super::CallError;
use super::call_async;
use super::call_sync;
use super::dispatch::Dispatcher;
use super::loader::Loader;
use super::loader::ModuleStore;
use super::snapshot::Snapshot;

/// Filename attributed to sources executed without one.
const ANONYMOUS_FILENAME: &str = "<anonymous>";

#[derive(Debug)]
pub enum Error {
    Call(CallError),
    /// `snapshot()` on an isolate constructed with `will_snapshot: false`.
    SnapshotDisabled,
    /// The isolate already ran to completion.
    Complete,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call(e) => write!(f, "Call error: {}", e),
            Self::SnapshotDisabled => {
                write!(f, "Snapshot support was not enabled at isolate creation")
            }
            Self::Complete => write!(f, "Isolate already ran to completion"),
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

/// Construction options. `will_snapshot` is fixed for the isolate's
/// lifetime; `snapshot` replaces the cold start with restored state.
#[derive(Default)]
pub struct IsolateOptions<'a> {
    pub will_snapshot: bool,
    pub snapshot: Option<&'a Snapshot>,
}

#[derive(Serialize)]
struct NewIsolateRequest {
    will_snapshot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_rid: Option<Rid>,
    loader_rid: Rid,
}

#[derive(Deserialize)]
struct RidResponse {
    rid: Rid,
}

#[derive(Serialize)]
struct RegisterOpRequest<'a> {
    rid: Rid,
    #[serde(rename = "dispatcherRid")]
    dispatcher_rid: Rid,
    name: &'a str,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    rid: Rid,
    source: &'a str,
    filename: &'a str,
}

#[derive(Serialize)]
struct ExecuteModuleRequest<'a> {
    rid: Rid,
    module_specifier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    module_store_rid: Option<Rid>,
}

#[derive(Serialize)]
struct IsolateRequest {
    rid: Rid,
}

/// Host handle to one guest execution context.
pub struct Isolate {
    rid: Rid,
    will_snapshot: bool,
    complete: AtomicBool,
    register_op_handle: OpHandle,
    execute_op: OpHandle,
    execute_module_op: OpHandle,
    is_complete_op: OpHandle,
    snapshot_op: OpHandle,
    snapshot_read_op: OpHandle,
}

impl Isolate {
    pub fn new(ops: &OpTable, loader: &dyn Loader, options: IsolateOptions<'_>) -> Result<Self> {
        let new_op = ops.load("new_isolate")?;
        let register_op_handle = ops.load("isolate_register_op")?;
        let execute_op = ops.load("isolate_execute")?;
        let execute_module_op = ops.load("isolate_execute_module")?;
        let is_complete_op = ops.load("isolate_is_complete")?;
        let snapshot_op = ops.load("isolate_snapshot")?;
        let snapshot_read_op = ops.load("snapshot_read")?;

        let request = NewIsolateRequest {
            will_snapshot: options.will_snapshot,
            snapshot_rid: options.snapshot.map(Snapshot::rid),
            loader_rid: loader.rid(),
        };
        let response: RidResponse = call_sync(&new_op, &request, None)?;

        Ok(Self {
            rid: response.rid,
            will_snapshot: options.will_snapshot,
            complete: AtomicBool::new(false),
            register_op_handle,
            execute_op,
            execute_module_op,
            is_complete_op,
            snapshot_op,
            snapshot_read_op,
        })
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    /// Binds a capability name to a dispatcher for this isolate. Rebinding a
    /// name keeps its numeric id and swaps the dispatcher behind it.
    pub fn register_op(&self, name: &str, dispatcher: &dyn Dispatcher) -> Result<()> {
        let request =
            RegisterOpRequest { rid: self.rid, dispatcher_rid: dispatcher.rid(), name };
        let _: Empty = call_sync(&self.register_op_handle, &request, None)?;
        Ok(())
    }

    /// Runs a script, suspending until its initial synchronous evaluation
    /// hands control back.
    pub async fn execute(&self, source: &str) -> Result<()> {
        self.execute_with_filename(source, ANONYMOUS_FILENAME).await
    }

    pub async fn execute_with_filename(&self, source: &str, filename: &str) -> Result<()> {
        self.check_live()?;
        let request = ExecuteRequest { rid: self.rid, source, filename };
        let _: Empty = call_async(&self.execute_op, &request, None).await?;
        Ok(())
    }

    /// Evaluates the module graph rooted at `specifier`, then waits for the
    /// guest to finish entirely.
    pub async fn execute_module(&self, specifier: &str) -> Result<()> {
        self.execute_module_inner(specifier, None).await
    }

    /// Like [`Isolate::execute_module`], with loads cached in `store`.
    pub async fn execute_module_with_store(
        &self,
        specifier: &str,
        store: &ModuleStore,
    ) -> Result<()> {
        self.execute_module_inner(specifier, Some(store.rid())).await
    }

    async fn execute_module_inner(
        &self,
        specifier: &str,
        module_store_rid: Option<Rid>,
    ) -> Result<()> {
        self.check_live()?;
        let request =
            ExecuteModuleRequest { rid: self.rid, module_specifier: specifier, module_store_rid };
        let _: Empty = call_async(&self.execute_module_op, &request, None).await?;
        self.run().await
    }

    /// Suspends until the guest's task queue, dispatch-driven callbacks
    /// included, has drained. The join point between host and guest
    /// lifetimes; afterwards the isolate is complete.
    pub async fn run(&self) -> Result<()> {
        self.check_live()?;
        let request = IsolateRequest { rid: self.rid };
        let _: Empty = call_async(&self.is_complete_op, &request, None).await?;
        self.complete.store(true, Ordering::Release);
        Ok(())
    }

    /// Captures the isolate's state. Refused locally, before any op is
    /// issued, unless the isolate was constructed with `will_snapshot`.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if !self.will_snapshot {
            return Err(Error::SnapshotDisabled);
        }
        let request = IsolateRequest { rid: self.rid };
        let response: RidResponse = call_sync(&self.snapshot_op, &request, None)?;
        Ok(Snapshot::from_parts(response.rid, self.snapshot_read_op.clone()))
    }

    fn check_live(&self) -> Result<()> {
        if self.complete.load(Ordering::Acquire) {
            return Err(Error::Complete);
        }
        Ok(())
    }
}
