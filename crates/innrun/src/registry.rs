//! # Resource registry
//!
//! Process-wide table mapping opaque handles to live boundary-side objects.
//! A handle carries identity and the right to operate on an object, never
//! ownership: dropping a host wrapper does not touch the resource, and an op
//! naming a handle the table no longer recognizes fails loudly instead of
//! reaching freed state.
//!
//! Uses DashMap so concurrent ops can allocate and look up handles without a
//! global lock.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;

/// Opaque handle to a boundary-side resource.
///
/// Serializes transparently as a bare integer, which is all the wire ever
/// sees of it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rid(pub u64);

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rid-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// No live resource under this handle.
    NotFound(Rid),
    /// The handle names a resource of a different kind.
    KindMismatch(Rid),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(rid) => write!(f, "Resource not found: {}", rid),
            Self::KindMismatch(rid) => write!(f, "Resource kind mismatch: {}", rid),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The table of live resources.
///
/// Handles are unique for the process lifetime; a removed handle's id is
/// never reissued. Mutation happens only through ops, so callers on the host
/// side of the boundary need no locking discipline of their own.
pub struct ResourceTable {
    entries: DashMap<Rid, Arc<dyn Any + Send + Sync>>,
    next_rid: AtomicU64,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), next_rid: AtomicU64::new(1) }
    }

    /// Stores `resource` and returns its freshly allocated handle.
    pub fn insert<T: Send + Sync + 'static>(&self, resource: Arc<T>) -> Rid {
        let rid = Rid(self.next_rid.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(rid, resource);
        rid
    }

    /// Retrieves the resource behind `rid`, checked against the expected kind.
    pub fn get<T: Send + Sync + 'static>(&self, rid: Rid) -> Result<Arc<T>> {
        let entry = self.entries.get(&rid).ok_or(Error::NotFound(rid))?;
        entry
            .value()
            .clone()
            .downcast::<T>()
            .map_err(|_| Error::KindMismatch(rid))
    }

    /// Drops the table's reference to `rid`. Ops naming the handle afterwards
    /// fail with [`Error::NotFound`]; clones already handed out stay alive.
    pub fn remove(&self, rid: Rid) -> Result<()> {
        self.entries.remove(&rid).ok_or(Error::NotFound(rid))?;
        Ok(())
    }

    pub fn contains(&self, rid: Rid) -> bool {
        self.entries.contains_key(&rid)
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}
