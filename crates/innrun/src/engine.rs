//! # Engine seam
//!
//! The script engine is an external collaborator: this crate defines the
//! contract it is driven through and knows nothing about how guest code
//! actually runs. An implementation of [`GuestEngine`] is injected into
//! [`Plugin::new`](crate::native::Plugin::new); the test suite drives a
//! deterministic scripted implementation, a real embedding supplies the
//! actual engine.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;

/// Module source handed back by a load request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSource {
    pub module_name: String,
    pub code: String,
}

/// A capability the guest invokes with a byte message.
///
/// The standard dispatcher parks the call until the host answers through the
/// respond op; custom implementations may answer inline.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, data: &[u8], zero_copy: Option<&[u8]>) -> anyhow::Result<Vec<u8>>;
}

/// Module resolution and retrieval supplied to an execution context.
///
/// Resolution and loading are independent phases of module graph
/// construction; implementations must allow a resolve and a load for
/// different modules to proceed concurrently.
#[async_trait::async_trait]
pub trait ModuleProvider: Send + Sync + 'static {
    async fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        is_root: bool,
    ) -> anyhow::Result<String>;

    async fn load(&self, module_specifier: &str) -> anyhow::Result<ModuleSource>;
}

/// Per-context table of named capabilities.
///
/// Names resolve to stable numeric op ids so a guest can look a name up once
/// and dispatch by id afterwards. Rebinding a name keeps its id and swaps the
/// dispatcher behind it; guests holding the resolved id transparently reach
/// the new dispatcher.
pub struct CapabilityTable {
    by_name: DashMap<String, u32>,
    by_id: DashMap<u32, Arc<dyn Dispatch>>,
    next_id: AtomicU32,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self { by_name: DashMap::new(), by_id: DashMap::new(), next_id: AtomicU32::new(1) }
    }

    /// Binds `name` to `dispatcher`, returning the name's numeric op id.
    pub fn bind(&self, name: &str, dispatcher: Arc<dyn Dispatch>) -> u32 {
        let id = *self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_id.insert(id, dispatcher);
        id
    }

    /// Resolves a capability name to its op id.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|entry| *entry.value())
    }

    /// Invokes the capability behind `op_id`.
    pub async fn dispatch(
        &self,
        op_id: u32,
        data: &[u8],
        zero_copy: Option<&[u8]>,
    ) -> anyhow::Result<Vec<u8>> {
        let dispatcher = self
            .by_id
            .get(&op_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("no capability bound for op id {op_id}"))?;
        dispatcher.dispatch(data, zero_copy).await
    }

    /// Name-resolving convenience over [`CapabilityTable::dispatch`].
    pub async fn dispatch_named(
        &self,
        name: &str,
        data: &[u8],
        zero_copy: Option<&[u8]>,
    ) -> anyhow::Result<Vec<u8>> {
        let op_id = self
            .lookup(name)
            .ok_or_else(|| anyhow::anyhow!("no capability named '{name}'"))?;
        self.dispatch(op_id, data, zero_copy).await
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Options fixed at context creation.
#[derive(Clone, Default)]
pub struct GuestConfig {
    /// Whether the context may later be serialized. Irreversible.
    pub will_snapshot: bool,
    /// Prior state to restore instead of a cold start.
    pub snapshot: Option<Arc<Vec<u8>>>,
}

/// Factory for guest execution contexts.
pub trait GuestEngine: Send + Sync + 'static {
    fn instantiate(
        &self,
        config: GuestConfig,
        caps: Arc<CapabilityTable>,
    ) -> anyhow::Result<Box<dyn GuestInstance>>;
}

/// One live guest execution context.
#[async_trait::async_trait]
pub trait GuestInstance: Send {
    /// Runs a script, returning once the initial synchronous portion of
    /// evaluation hands control back. Pending guest callbacks may remain.
    async fn evaluate(&mut self, filename: &str, source: &str) -> anyhow::Result<()>;

    /// Resolves, loads and evaluates the module graph rooted at `specifier`,
    /// pulling sources through `modules`.
    async fn evaluate_module(
        &mut self,
        specifier: &str,
        modules: Arc<dyn ModuleProvider>,
    ) -> anyhow::Result<()>;

    /// Suspends until the guest's task queue has fully drained.
    async fn drain(&mut self) -> anyhow::Result<()>;

    /// Serializes the context's accumulated state.
    fn snapshot(&mut self) -> anyhow::Result<Vec<u8>>;
}
