//! Unit tests for the channel, registry and capability table.

use std::sync::Arc;

use crate::engine::CapabilityTable;
use crate::engine::Dispatch;
use crate::ops;
use crate::ops::OpOutcome;
use crate::ops::OpTableBuilder;
use crate::registry::Error as RegistryError;
use crate::registry::ResourceTable;
use crate::registry::Rid;

struct EchoDispatch;

#[async_trait::async_trait]
impl Dispatch for EchoDispatch {
    async fn dispatch(&self, data: &[u8], _zero_copy: Option<&[u8]>) -> anyhow::Result<Vec<u8>> {
        let mut response = b"echo:".to_vec();
        response.extend_from_slice(data);
        Ok(response)
    }
}

struct FixedDispatch(&'static [u8]);

#[async_trait::async_trait]
impl Dispatch for FixedDispatch {
    async fn dispatch(&self, _data: &[u8], _zero_copy: Option<&[u8]>) -> anyhow::Result<Vec<u8>> {
        Ok(self.0.to_vec())
    }
}

// --- Registry ---

#[test]
fn test_registry_insert_and_get() {
    let table = ResourceTable::new();
    let rid = table.insert(Arc::new("resource".to_string()));

    let value = table.get::<String>(rid).unwrap();
    assert_eq!(*value, "resource");
    assert!(table.contains(rid));
}

#[test]
fn test_registry_handles_are_unique() {
    let table = ResourceTable::new();
    let a = table.insert(Arc::new(1u32));
    let b = table.insert(Arc::new(2u32));
    assert_ne!(a, b);
}

#[test]
fn test_registry_unknown_handle() {
    let table = ResourceTable::new();
    let err = table.get::<String>(Rid(404)).unwrap_err();
    assert_eq!(err, RegistryError::NotFound(Rid(404)));
}

#[test]
fn test_registry_kind_mismatch() {
    let table = ResourceTable::new();
    let rid = table.insert(Arc::new(7u32));
    let err = table.get::<String>(rid).unwrap_err();
    assert_eq!(err, RegistryError::KindMismatch(rid));
}

#[test]
fn test_registry_remove_invalidates_handle() {
    let table = ResourceTable::new();
    let rid = table.insert(Arc::new(7u32));
    table.remove(rid).unwrap();

    assert_eq!(table.get::<u32>(rid).unwrap_err(), RegistryError::NotFound(rid));
    assert_eq!(table.remove(rid).unwrap_err(), RegistryError::NotFound(rid));
}

// --- Op channel ---

fn test_table() -> crate::ops::OpTable {
    OpTableBuilder::new()
        .register("always_sync", |_payload: &[u8], _zero_copy: Option<&[u8]>| {
            OpOutcome::Sync(b"now".to_vec())
        })
        .register("always_async", |_payload: &[u8], _zero_copy: Option<&[u8]>| {
            OpOutcome::Async(Box::pin(async { b"later".to_vec() }))
        })
        .build()
}

#[test]
fn test_unknown_op() {
    let table = test_table();
    let err = table.load("missing_op").unwrap_err();
    assert_eq!(err, ops::Error::UnknownOp("missing_op".into()));
}

#[test]
fn test_sync_call_returns_bytes() {
    let table = test_table();
    let op = table.load("always_sync").unwrap();
    assert_eq!(op.call_sync(b"{}", None).unwrap(), b"now");
}

#[tokio::test]
async fn test_async_call_returns_bytes() {
    let table = test_table();
    let op = table.load("always_async").unwrap();
    assert_eq!(op.call_async(b"{}", None).await.unwrap(), b"later");
}

#[test]
fn test_sync_call_on_deferred_result_is_a_mismatch() {
    let table = test_table();
    let op = table.load("always_async").unwrap();
    let err = op.call_sync(b"{}", None).unwrap_err();
    assert_eq!(err, ops::Error::SyncOpReturnedAsync("always_async".into()));
}

#[tokio::test]
async fn test_async_call_on_immediate_result_is_a_mismatch() {
    let table = test_table();
    let op = table.load("always_sync").unwrap();
    let err = op.call_async(b"{}", None).await.unwrap_err();
    assert_eq!(err, ops::Error::AsyncOpReturnedSync("always_sync".into()));
}

// --- Capability table ---

#[test]
fn test_capability_bind_and_lookup() {
    let caps = CapabilityTable::new();
    let id = caps.bind("testOp", Arc::new(EchoDispatch));

    assert_eq!(caps.lookup("testOp"), Some(id));
    assert_eq!(caps.lookup("other"), None);
}

#[test]
fn test_capability_ids_are_distinct_per_name() {
    let caps = CapabilityTable::new();
    let a = caps.bind("a", Arc::new(EchoDispatch));
    let b = caps.bind("b", Arc::new(EchoDispatch));
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_capability_rebind_keeps_id_and_swaps_dispatcher() {
    let caps = CapabilityTable::new();
    let first = caps.bind("testOp", Arc::new(FixedDispatch(b"one")));
    let second = caps.bind("testOp", Arc::new(FixedDispatch(b"two")));

    assert_eq!(first, second);
    let response = caps.dispatch(first, b"x", None).await.unwrap();
    assert_eq!(response, b"two");
}

#[tokio::test]
async fn test_capability_dispatch_named() {
    let caps = CapabilityTable::new();
    caps.bind("echo", Arc::new(EchoDispatch));

    let response = caps.dispatch_named("echo", b"hi", None).await.unwrap();
    assert_eq!(response, b"echo:hi");
}

#[tokio::test]
async fn test_capability_dispatch_unknown_id() {
    let caps = CapabilityTable::new();
    let err = caps.dispatch(99, b"", None).await.unwrap_err();
    assert!(err.to_string().contains("no capability bound"));
}
