//! # Snapshot, host side
//!
//! A handle to an opaque blob. Reading is idempotent; the bytes never change
//! once captured. The handle can be fed back into a new isolate's
//! constructor in place of a cold start.

use serde::Deserialize;
use serde::Serialize;

use crate::ops;
use crate::ops::OpHandle;
use crate::ops::OpTable;
use crate::registry::Rid;

use super::CallError;
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

#[derive(Deserialize)]
struct RidResponse {
    rid: Rid,
}

#[derive(Serialize)]
struct ReadRequest {
    rid: Rid,
}

#[derive(Deserialize)]
struct ReadResponse {
    data: Vec<u8>,
}

/// Host handle to a captured snapshot.
pub struct Snapshot {
    rid: Rid,
    read_op: OpHandle,
}

impl Snapshot {
    pub(crate) fn from_parts(rid: Rid, read_op: OpHandle) -> Self {
        Self { rid, read_op }
    }

    /// Registers raw snapshot bytes as a boundary-side resource, e.g. state
    /// previously persisted with [`Snapshot::read`].
    pub fn from_bytes(ops: &OpTable, data: &[u8]) -> Result<Self> {
        let new_op = ops.load("new_snapshot")?;
        let read_op = ops.load("snapshot_read")?;
        let response: RidResponse = call_sync(&new_op, &innwire::Empty {}, Some(data))?;
        Ok(Self { rid: response.rid, read_op })
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    /// Returns the serialized bytes for persistence.
    pub fn read(&self) -> Result<Vec<u8>> {
        let response: ReadResponse =
            call_sync(&self.read_op, &ReadRequest { rid: self.rid }, None)?;
        Ok(response.data)
    }
}
