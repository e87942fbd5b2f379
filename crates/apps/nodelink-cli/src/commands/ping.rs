//! Ping command.

use std::time::Instant;

use nodelink_net::health::{health_check_request, is_valid_echo};
use nodelink_types::NetworkContactPoint;
use tracing::debug;

use crate::config::CliConfig;
use crate::context::probe_node;
use crate::error::{CliError, CliResult};
use crate::output::{OutputFormat, PingOutput, Render};

/// Execute the ping command.
///
/// Connects to `contact` with a throwaway identity and sends `count`
/// health checks, reporting each round trip.
pub async fn ping(config: CliConfig, format: OutputFormat, contact: &str, count: u32) -> CliResult<String> {
    let contact_point: NetworkContactPoint = contact.parse()?;
    let node = probe_node(&config)?;

    let result = async {
        let connection = node.network().connect(&contact_point, false).await?;
        let remote = connection
            .remote()
            .cloned()
            .ok_or_else(|| CliError::user("Connected peer did not identify itself"))?;
        let timeout = node.network().config().request_timeout;

        let mut round_trips_ms = Vec::with_capacity(count as usize);
        for seq in 0..count {
            let request = health_check_request();
            let started = Instant::now();
            let response = connection.request(request.clone(), timeout).await;
            if !is_valid_echo(&request, &response) {
                return Err(CliError::user(format!(
                    "Health check {} failed ({}): {}",
                    seq + 1,
                    response.result_code(),
                    response.error_message().unwrap_or("echo did not match")
                )));
            }
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            debug!(seq, elapsed_ms = elapsed, "Health check answered");
            round_trips_ms.push(elapsed);
        }

        Ok(PingOutput {
            contact_point: contact_point.to_string(),
            node_id: remote.id.to_string(),
            display_name: remote.display_name,
            round_trips_ms,
        })
    }
    .await;

    node.shutdown().await;
    Ok(result?.render(format))
}
