//! Initialize node command.

use std::path::Path;

use crate::config::CliConfig;
use crate::context::{is_initialized, NodeContext};
use crate::error::{CliError, CliResult};
use crate::output::{InitOutput, OutputFormat, Render};

/// Execute the init command.
///
/// Creates the data directory and settings store, generates the persistent
/// node id and saves `config` to `config_path`.
pub fn init(config: CliConfig, config_path: &Path, format: OutputFormat) -> CliResult<String> {
    let data_dir = config.data_dir();
    if is_initialized(&config) {
        return Err(CliError::AlreadyInitialized(data_dir.display().to_string()));
    }

    let ctx = NodeContext::for_init(config)?;
    ctx.config.save(config_path)?;

    let output = InitOutput {
        node_id: ctx.identity.id.to_string(),
        data_dir: data_dir.display().to_string(),
        config_path: config_path.display().to_string(),
    };
    Ok(output.render(format))
}
