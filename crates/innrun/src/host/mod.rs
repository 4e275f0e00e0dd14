//! # Host-side protocol surface
//!
//! Thin wrappers over the op channel. Each capability is a small value type
//! holding its handle plus the ops that drive it; the perpetual await/respond
//! loops live in spawned tasks that park on the channel's async receives.
//! Nothing here touches the registry directly.

pub mod dispatch;
pub mod isolate;
pub mod loader;
pub mod snapshot;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ops;
use crate::ops::OpHandle;

/// Failure of a single host-side boundary call.
#[derive(Debug)]
pub enum CallError {
    /// The channel itself misbehaved (unknown op, sync/async mismatch).
    Channel(ops::Error),
    /// Encoding failed, the envelope was malformed, or it carried an error.
    Wire(innwire::Error),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(e) => write!(f, "Channel error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

impl std::error::Error for CallError {}

impl From<ops::Error> for CallError {
    fn from(e: ops::Error) -> Self {
        Self::Channel(e)
    }
}

impl From<innwire::Error> for CallError {
    fn from(e: innwire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type CallResult<T> = std::result::Result<T, CallError>;

/// Issues a sync op and unwraps its envelope.
pub(crate) fn call_sync<Req, Resp>(
    op: &OpHandle,
    request: &Req,
    zero_copy: Option<&[u8]>,
) -> CallResult<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = innwire::to_payload(request)?;
    let bytes = op.call_sync(&payload, zero_copy)?;
    Ok(innwire::decode_data(&bytes)?)
}

/// Issues an async op, suspends until it resolves, and unwraps its envelope.
pub(crate) async fn call_async<Req, Resp>(
    op: &OpHandle,
    request: &Req,
    zero_copy: Option<&[u8]>,
) -> CallResult<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = innwire::to_payload(request)?;
    let bytes = op.call_async(&payload, zero_copy).await?;
    Ok(innwire::decode_data(&bytes)?)
}
