//! # Boundary-side op implementations
//!
//! Everything the host reaches through the op channel lives here: the
//! resource registry, the standard dispatcher and loader, isolates and
//! snapshots. The op table is built once, explicitly, by [`Plugin::new`] and
//! injected into host-side constructors; nothing is discovered at load time
//! or stashed in a global.

mod dispatch;
mod isolate;
mod loader;
mod snapshot;
mod support;

use std::sync::Arc;

use innwire::Empty;
use serde::Deserialize;

use crate::engine::Dispatch;
use crate::engine::GuestEngine;
use crate::ops::OpTable;
use crate::ops::OpTableBuilder;
use crate::registry::ResourceTable;
use crate::registry::Rid;

use support::OpResult;

#[derive(Deserialize)]
struct CloseResourceRequest {
    rid: Rid,
}

/// The loaded plugin: a resource registry, a guest engine, and the op table
/// tying them together.
pub struct Plugin {
    resources: Arc<ResourceTable>,
    ops: OpTable,
}

impl Plugin {
    pub fn new(engine: Arc<dyn GuestEngine>) -> Self {
        let resources = Arc::new(ResourceTable::new());

        let builder = OpTableBuilder::new();
        let builder = dispatch::install(builder, &resources);
        let builder = loader::install(builder, &resources);
        let builder = isolate::install(builder, &resources, &engine);
        let builder = snapshot::install(builder, &resources);
        let builder =
            builder.register("close_resource", support::table_op(&resources, op_close_resource));

        Self { resources, ops: builder.build() }
    }

    /// The op table host-side wrappers are constructed against.
    pub fn ops(&self) -> OpTable {
        self.ops.clone()
    }

    /// Inserts a custom dispatch capability directly, bypassing the standard
    /// dispatcher's command loop. The returned handle is valid anywhere a
    /// dispatcher handle is expected, `isolate_register_op` included.
    pub fn register_dispatcher(&self, dispatcher: Arc<dyn Dispatch>) -> Rid {
        self.resources.insert(Arc::new(dispatch::DispatcherResource(dispatcher)))
    }
}

fn op_close_resource(
    resources: &Arc<ResourceTable>,
    payload: &[u8],
    _zero_copy: Option<&[u8]>,
) -> OpResult {
    let request: CloseResourceRequest = support::parse_request(payload)?;
    resources.remove(request.rid)?;
    tracing::debug!(rid = %request.rid, "closed resource");
    Ok(support::sync_ok(Empty {}))
}
