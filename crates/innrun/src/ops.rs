//! # Op channel and op table
//!
//! The low-level call primitive across the host/guest boundary. An op takes a
//! JSON payload plus an optional zero-copy buffer and produces either an
//! immediate byte result or a deferred one. The two flavors are distinct
//! contracts: handle allocation and responds are always immediate, while
//! command waits park until the guest produces work. Mixing them up is a
//! protocol violation surfaced as a type-mismatch error, never coerced.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

/// The two legal shapes of an op's result.
pub enum OpOutcome {
    /// Bytes available before the caller resumes.
    Sync(Vec<u8>),
    /// Bytes at some later point; the caller suspends.
    Async(BoxFuture<'static, Vec<u8>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// No op registered under this name.
    UnknownOp(String),
    /// A sync call reached an op that produced a deferred result.
    SyncOpReturnedAsync(String),
    /// An async call reached an op that produced an immediate result.
    AsyncOpReturnedSync(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOp(name) => write!(f, "Unknown op '{}'", name),
            Self::SyncOpReturnedAsync(name) => {
                write!(f, "Sync op '{}' produced a deferred result", name)
            }
            Self::AsyncOpReturnedSync(name) => {
                write!(f, "Async op '{}' produced an immediate result", name)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One named op implementation on the far side of the boundary.
pub trait OpHandler: Send + Sync {
    fn handle(&self, payload: &[u8], zero_copy: Option<&[u8]>) -> OpOutcome;
}

impl<F> OpHandler for F
where
    F: Fn(&[u8], Option<&[u8]>) -> OpOutcome + Send + Sync,
{
    fn handle(&self, payload: &[u8], zero_copy: Option<&[u8]>) -> OpOutcome {
        self(payload, zero_copy)
    }
}

/// Immutable name → op map.
///
/// Built once at plugin construction and handed to host-side constructors
/// explicitly. Keeping the table a value (rather than a module-level
/// singleton) keeps initialization order visible and lets tests inject
/// doubles for individual ops.
#[derive(Clone)]
pub struct OpTable {
    ops: Arc<HashMap<String, Arc<dyn OpHandler>>>,
}

impl OpTable {
    /// Looks up a named op, yielding a handle the caller keeps for the
    /// resource's lifetime.
    pub fn load(&self, name: &str) -> Result<OpHandle> {
        let handler = self
            .ops
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownOp(name.to_string()))?;
        Ok(OpHandle { name: Arc::from(name), handler })
    }
}

/// Accumulates op registrations before freezing them into an [`OpTable`].
pub struct OpTableBuilder {
    ops: HashMap<String, Arc<dyn OpHandler>>,
}

impl OpTableBuilder {
    pub fn new() -> Self {
        Self { ops: HashMap::new() }
    }

    /// Registers `handler` under `name`, replacing any previous registration.
    pub fn register<H>(mut self, name: &str, handler: H) -> Self
    where
        H: OpHandler + 'static,
    {
        self.ops.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn build(self) -> OpTable {
        OpTable { ops: Arc::new(self.ops) }
    }
}

impl Default for OpTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-side handle to one named op.
#[derive(Clone)]
pub struct OpHandle {
    name: Arc<str>,
    handler: Arc<dyn OpHandler>,
}

impl std::fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpHandle").field("name", &self.name).finish_non_exhaustive()
    }
}

impl OpHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the op expecting an immediate result.
    pub fn call_sync(&self, payload: &[u8], zero_copy: Option<&[u8]>) -> Result<Vec<u8>> {
        match self.handler.handle(payload, zero_copy) {
            OpOutcome::Sync(bytes) => Ok(bytes),
            OpOutcome::Async(_) => Err(Error::SyncOpReturnedAsync(self.name.to_string())),
        }
    }

    /// Invokes the op expecting a deferred result, suspending until it lands.
    pub async fn call_async(&self, payload: &[u8], zero_copy: Option<&[u8]>) -> Result<Vec<u8>> {
        match self.handler.handle(payload, zero_copy) {
            OpOutcome::Async(fut) => Ok(fut.await),
            OpOutcome::Sync(_) => Err(Error::AsyncOpReturnedSync(self.name.to_string())),
        }
    }
}
