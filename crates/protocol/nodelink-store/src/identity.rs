//! Persistent node identifier.
//!
//! The node id is read once at startup. When no id has been stored yet a
//! fresh one is generated and saved, so the node keeps its id across
//! restarts.

use nodelink_types::NodeId;
use tracing::{info, warn};

use crate::error::Result;
use crate::settings::SettingsStore;

/// Settings key holding the persistent node id.
pub const PERSISTENT_ID_KEY: &str = "nodelink.node.persistentId";

/// Read the stored node id, or generate and store a new one.
///
/// An `override_id` takes precedence when present; it must have the
/// persistent `[0-9a-f]{32}` form and is not written to the store.
pub fn read_or_generate_node_id(
    store: &dyn SettingsStore,
    override_id: Option<&str>,
) -> Result<NodeId> {
    if let Some(raw) = override_id {
        let id = NodeId::from_persistent(raw)?;
        info!(node_id = %id, "Using node id override");
        return Ok(id);
    }

    if let Some(stored) = store.get(PERSISTENT_ID_KEY)? {
        match NodeId::from_persistent(&stored) {
            Ok(id) => return Ok(id),
            Err(e) => warn!(error = %e, "Ignoring malformed stored node id"),
        }
    }

    let id = NodeId::generate();
    store.set(PERSISTENT_ID_KEY, id.as_str())?;
    info!(node_id = %id, "Generated new persistent node id");
    Ok(id)
}
