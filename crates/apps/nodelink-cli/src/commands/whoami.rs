//! Show identity information command.

use crate::config::CliConfig;
use crate::context::NodeContext;
use crate::error::CliResult;
use crate::output::{OutputFormat, Render, WhoamiOutput};

/// Execute the whoami command.
pub fn whoami(config: CliConfig, format: OutputFormat) -> CliResult<String> {
    let ctx = NodeContext::local(config)?;

    let contact_points = ctx
        .config
        .listen_contact_point()
        .map(|cp| ctx.config.advertised(&cp).to_string())
        .into_iter()
        .collect();

    let output = WhoamiOutput {
        node_id: ctx.identity.id.to_string(),
        display_name: ctx.identity.display_name.clone(),
        workflow_host: ctx.identity.is_workflow_host,
        legacy_id: ctx.identity.legacy_id.as_ref().map(ToString::to_string),
        contact_points,
    };
    Ok(output.render(format))
}
