//! Peers command.

use crate::config::CliConfig;
use crate::context::probe_node;
use crate::error::CliResult;
use crate::output::{OutputFormat, PeersOutput, Render};

/// Execute the peers command.
///
/// Joins the network through `contact` and lists every node the
/// discovery pass reaches, excluding the probing node itself.
pub async fn peers(
    config: CliConfig,
    format: OutputFormat,
    contact: &str,
    workflow_hosts_only: bool,
) -> CliResult<String> {
    let node = probe_node(&config)?;
    let communication = node.communication();

    let result = async {
        communication.add_runtime_peer(contact).await?;
        let state = communication.get_current_network_state().await;
        let nodes = state
            .nodes()
            .filter(|n| !n.is_local_node)
            .filter(|n| !workflow_hosts_only || n.is_workflow_host)
            .cloned()
            .collect();
        CliResult::Ok(PeersOutput {
            via: contact.to_string(),
            nodes,
        })
    }
    .await;

    node.shutdown().await;
    Ok(result?.render(format))
}
