//! # Standard dispatcher, host side
//!
//! Construction allocates the boundary-side state and immediately spawns the
//! command pump: await the next command, invoke `ondispatch`, respond with
//! the same cmd_id. The pump never fetches command N+1 before it has
//! answered command N, which is what makes per-dispatcher ordering a
//! guarantee rather than an accident of scheduling.

use std::sync::Arc;
use std::sync::RwLock;

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

/// Anything an isolate can bind a capability name to.
pub trait Dispatcher {
    fn rid(&self) -> Rid;
}

/// Callback servicing one guest command; returns the response bytes.
pub type DispatchFn =
    Box<dyn Fn(&[u8], Option<&[u8]>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

type SharedHook = Arc<RwLock<Option<DispatchFn>>>;

#[derive(Deserialize)]
struct NewStdDispatcherResponse {
    std_dispatcher_rid: Rid,
    dispatcher_rid: Rid,
}

#[derive(Serialize)]
struct WaitRequest {
    rid: Rid,
}

#[derive(Deserialize)]
struct WaitForDispatchResponse {
    cmd_id: u64,
    data: Vec<u8>,
    #[serde(default)]
    zero_copy: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct RespondRequest {
    rid: Rid,
    cmd_id: u64,
}

/// Host handle to a standard dispatcher.
///
/// `ondispatch` is supplied after construction; a command arriving before
/// that is a caller error and terminates the pump.
pub struct StdDispatcher {
    rid: Rid,
    std_rid: Rid,
    hook: SharedHook,
}

impl StdDispatcher {
    /// Allocates the dispatcher and starts its pump. Must be called from
    /// within a tokio runtime.
    pub fn new(ops: &OpTable) -> Result<Self> {
        let new_op = ops.load("new_std_dispatcher")?;
        let wait_op = ops.load("std_dispatcher_wait_for_dispatch")?;
        let respond_op = ops.load("std_dispatcher_respond")?;

        let response: NewStdDispatcherResponse = call_sync(&new_op, &Empty {}, None)?;
        let hook: SharedHook = Arc::new(RwLock::new(None));

        let std_rid = response.std_dispatcher_rid;
        let pump_hook = hook.clone();
        tokio::spawn(async move {
            let error = run_pump(wait_op, respond_op, std_rid, pump_hook).await;
            tracing::error!(rid = %std_rid, error = %error, "dispatcher pump terminated");
        });

        Ok(Self { rid: response.dispatcher_rid, std_rid, hook })
    }

    /// Installs the command callback. Replacing an existing callback takes
    /// effect from the next command.
    pub fn set_ondispatch<F>(&self, ondispatch: F)
    where
        F: Fn(&[u8], Option<&[u8]>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        let mut guard = match self.hook.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Box::new(ondispatch));
    }

    /// Handle of the boundary-side command state (as opposed to the
    /// dispatcher capability handle isolates bind).
    pub fn std_rid(&self) -> Rid {
        self.std_rid
    }
}

impl Dispatcher for StdDispatcher {
    fn rid(&self) -> Rid {
        self.rid
    }
}

/// Host handle to a dispatch capability registered directly on the boundary
/// side (no command pump; it answers inline).
pub struct CustomDispatcher {
    rid: Rid,
}

impl CustomDispatcher {
    pub fn from_rid(rid: Rid) -> Self {
        Self { rid }
    }
}

impl Dispatcher for CustomDispatcher {
    fn rid(&self) -> Rid {
        self.rid
    }
}

async fn run_pump(
    wait_op: OpHandle,
    respond_op: OpHandle,
    rid: Rid,
    hook: SharedHook,
) -> anyhow::Error {
    loop {
        let command: WaitForDispatchResponse =
            match call_async(&wait_op, &WaitRequest { rid }, None).await {
                Ok(command) => command,
                Err(e) => break e.into(),
            };

        let result = {
            let guard = match hook.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match guard.as_ref() {
                Some(ondispatch) => ondispatch(&command.data, command.zero_copy.as_deref()),
                None => break anyhow::anyhow!(
                    "command {} arrived before ondispatch was configured",
                    command.cmd_id
                ),
            }
        };
        let response = match result {
            Ok(bytes) => bytes,
            Err(e) => break e.context(format!("ondispatch failed for command {}", command.cmd_id)),
        };

        let request = RespondRequest { rid, cmd_id: command.cmd_id };
        if let Err(e) = call_sync::<_, Empty>(&respond_op, &request, Some(&response)) {
            break e.into();
        }
    }
}
