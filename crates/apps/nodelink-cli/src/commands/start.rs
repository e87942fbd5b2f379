//! Start node command.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CliConfig;
use crate::context::NodeContext;
use crate::error::CliResult;
use crate::output::{OutputFormat, Render, StartOutput};
use crate::signals::shutdown_signal;

/// Execute the start command: serve until Ctrl+C or SIGTERM.
pub async fn start(config: CliConfig, format: OutputFormat) -> CliResult<String> {
    serve(config, format, shutdown_signal()).await
}

/// Run the node until `shutdown` turns `true` or its sender is dropped.
///
/// Servers and health checks start first; static contacts are connected
/// in the background after the configured delay.
pub async fn serve(
    config: CliConfig,
    format: OutputFormat,
    mut shutdown: watch::Receiver<bool>,
) -> CliResult<String> {
    let ctx = NodeContext::local(config)?;
    let node = Arc::new(ctx.build_node()?);
    let bound = node.start().await?;

    let output = StartOutput {
        node_id: node.identity().id.to_string(),
        contact_points: bound.iter().map(|cp| ctx.config.advertised(cp).to_string()).collect(),
        static_contacts: node.static_contacts().iter().map(ToString::to_string).collect(),
    };
    println!("{}", output.render(format));
    if format == OutputFormat::Human {
        println!("\nPress Ctrl+C to stop the node...\n");
    }

    let connector = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let reached = node.connect_static_contacts().await;
            info!(count = reached.len(), "Static contacts connected");
        })
    };

    let mut topology = node.communication().subscribe_topology();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            change = topology.recv() => match change {
                Ok(change) => debug!(generation = change.generation, cause = ?change.cause, "Topology changed"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Topology events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down...");
    connector.abort();
    node.shutdown().await;
    Ok("Node stopped gracefully.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init::init;
    use crate::error::CliError;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> CliConfig {
        let mut config = CliConfig::default();
        config.storage.data_dir = Some(temp_dir.path().join("data"));
        config.network.bind_address = "127.0.0.1".into();
        config.network.port = Some(0);
        config.network.health_checks = false;
        config
    }

    #[tokio::test]
    async fn test_start_without_init() {
        let temp_dir = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(false);
        let result = serve(test_config(&temp_dir), OutputFormat::Human, rx).await;
        assert!(matches!(result, Err(CliError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        init(config.clone(), &temp_dir.path().join("config.toml"), OutputFormat::Human).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(serve(config, OutputFormat::Json, rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), "Node stopped gracefully.");
    }

    #[tokio::test]
    async fn test_invalid_static_contact_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        init(config.clone(), &temp_dir.path().join("config.toml"), OutputFormat::Human).unwrap();
        config.network.static_contacts = vec!["nonsense".into()];

        let (_tx, rx) = watch::channel(false);
        let result = serve(config, OutputFormat::Human, rx).await;
        assert!(matches!(result, Err(CliError::Types(_))));
    }
}
