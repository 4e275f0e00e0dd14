//! Shared plumbing for op implementations: request parsing and envelope
//! wrapping, so every op fails the same way.

use std::future::Future;
use std::sync::Arc;

use innwire::Envelope;
use innwire::OpError;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ops::OpOutcome;
use crate::registry::ResourceTable;
use crate::registry::Rid;

/// An op body's result before envelope wrapping.
pub(crate) type OpResult = std::result::Result<OpOutcome, OpError>;

/// Response carrying a single freshly allocated handle.
#[derive(Serialize)]
pub(crate) struct RidResponse {
    pub rid: Rid,
}

impl From<crate::registry::Error> for OpError {
    fn from(e: crate::registry::Error) -> Self {
        OpError::new(e.to_string())
    }
}

/// Decodes an op's JSON request payload.
pub(crate) fn parse_request<Req: DeserializeOwned>(payload: &[u8]) -> Result<Req, OpError> {
    serde_json::from_slice(payload)
        .map_err(|e| OpError::new(format!("malformed op request: {e}")))
}

/// Success envelope around `data`, as bytes.
pub(crate) fn ok_bytes<D: Serialize>(data: D) -> Vec<u8> {
    innwire::encode(&Envelope::ok(data))
        .unwrap_or_else(|e| innwire::fail_bytes(&format!("response encode failure: {e}")))
}

/// Success envelope around `data`, as an immediate result.
pub(crate) fn sync_ok<D: Serialize>(data: D) -> OpOutcome {
    OpOutcome::Sync(ok_bytes(data))
}

/// Deferred result; the future's failure becomes an error envelope.
pub(crate) fn async_op<F>(fut: F) -> OpOutcome
where
    F: Future<Output = Result<Vec<u8>, OpError>> + Send + 'static,
{
    OpOutcome::Async(Box::pin(async move {
        match fut.await {
            Ok(bytes) => bytes,
            Err(e) => innwire::fail_bytes(&e.message),
        }
    }))
}

/// Converts a failed op body into an error envelope; the channel call itself
/// still succeeds.
pub(crate) fn finish(result: OpResult) -> OpOutcome {
    result.unwrap_or_else(|e| OpOutcome::Sync(innwire::fail_bytes(&e.message)))
}

/// Adapts an op function over the resource table into an op handler closure.
pub(crate) fn table_op(
    resources: &Arc<ResourceTable>,
    f: fn(&Arc<ResourceTable>, &[u8], Option<&[u8]>) -> OpResult,
) -> impl Fn(&[u8], Option<&[u8]>) -> OpOutcome + Send + Sync + 'static {
    let resources = resources.clone();
    move |payload: &[u8], zero_copy: Option<&[u8]>| finish(f(&resources, payload, zero_copy))
}
