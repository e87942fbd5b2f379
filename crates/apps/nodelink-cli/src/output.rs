//! Output formatting for CLI.

use colored::Colorize;
use nodelink_ops::NetworkStateNode;
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use 'human' or 'json'.", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Trait for renderable output.
pub trait Render {
    /// Render as human-readable string.
    fn render_human(&self) -> String;

    /// Render as JSON string.
    fn render_json(&self) -> String;

    /// Render in the specified format.
    fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Human => self.render_human(),
            OutputFormat::Json => self.render_json(),
        }
    }
}

// =============================================================================
// Output Types
// =============================================================================

/// Output for node initialization.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub node_id: String,
    pub data_dir: String,
    pub config_path: String,
}

impl Render for InitOutput {
    fn render_human(&self) -> String {
        format!(
            "{} {}\n{} {}\n{} {}",
            "Node initialized:".green().bold(),
            self.node_id,
            "Data directory:".green(),
            self.data_dir,
            "Configuration saved to:".green(),
            self.config_path
        )
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Output for whoami command.
#[derive(Debug, Serialize)]
pub struct WhoamiOutput {
    pub node_id: String,
    pub display_name: String,
    pub workflow_host: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<String>,
    pub contact_points: Vec<String>,
}

impl Render for WhoamiOutput {
    fn render_human(&self) -> String {
        let mut lines = vec![
            format!("{} {}", "Node ID:".bold(), self.node_id),
            format!("{} {}", "Name:".bold(), self.display_name),
            format!("{} {}", "Workflow Host:".bold(), yes_no(self.workflow_host)),
        ];
        if let Some(legacy) = &self.legacy_id {
            lines.push(format!("{} {}", "Legacy ID:".bold(), legacy));
        }
        if self.contact_points.is_empty() {
            lines.push(format!("{} {}", "Contact Points:".bold(), "none (client only)".dimmed()));
        } else {
            lines.push(format!("{}", "Contact Points:".bold()));
            for cp in &self.contact_points {
                lines.push(format!("  {}", cp));
            }
        }
        lines.join("\n")
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Output for start command, printed once the node is up.
#[derive(Debug, Serialize)]
pub struct StartOutput {
    pub node_id: String,
    pub contact_points: Vec<String>,
    pub static_contacts: Vec<String>,
}

impl Render for StartOutput {
    fn render_human(&self) -> String {
        let mut lines = vec![format!("{} {}", "nodelink node started:".green().bold(), self.node_id)];
        if !self.contact_points.is_empty() {
            lines.push(format!("{}", "Listening on:".bold()));
            for cp in &self.contact_points {
                lines.push(format!("  {}", cp));
            }
        }
        if !self.static_contacts.is_empty() {
            lines.push(format!("{}", "Static contacts:".bold()));
            for cp in &self.static_contacts {
                lines.push(format!("  {}", cp));
            }
        }
        lines.join("\n")
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Output for ping command.
#[derive(Debug, Serialize)]
pub struct PingOutput {
    pub contact_point: String,
    pub node_id: String,
    pub display_name: String,
    pub round_trips_ms: Vec<f64>,
}

impl PingOutput {
    /// Mean round trip, if any ping was sent.
    pub fn average_ms(&self) -> Option<f64> {
        if self.round_trips_ms.is_empty() {
            return None;
        }
        Some(self.round_trips_ms.iter().sum::<f64>() / self.round_trips_ms.len() as f64)
    }
}

impl Render for PingOutput {
    fn render_human(&self) -> String {
        let mut lines = vec![format!(
            "{} {} ({}) at {}",
            "Connected to".green().bold(),
            self.display_name,
            self.node_id,
            self.contact_point
        )];
        for (seq, rtt) in self.round_trips_ms.iter().enumerate() {
            lines.push(format!("  health check {}: {:.2} ms", seq + 1, rtt));
        }
        if let Some(avg) = self.average_ms() {
            lines.push(format!("{} {:.2} ms", "Average:".bold(), avg));
        }
        lines.join("\n")
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Output for peers command.
#[derive(Debug, Serialize)]
pub struct PeersOutput {
    pub via: String,
    pub nodes: Vec<NetworkStateNode>,
}

impl Render for PeersOutput {
    fn render_human(&self) -> String {
        if self.nodes.is_empty() {
            return format!("No nodes reachable through {}", self.via);
        }
        let mut lines = vec![format!(
            "{} ({} through {})",
            "Reachable nodes".bold(),
            self.nodes.len(),
            self.via
        )];
        for node in &self.nodes {
            let host = if node.is_workflow_host {
                " [workflow host]".cyan().to_string()
            } else {
                String::new()
            };
            lines.push(format!("  {}  {}{}", node.node_id, node.display_name, host));
        }
        lines.join("\n")
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// One discovered route.
#[derive(Debug, Serialize)]
pub struct RouteLine {
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

/// Output for routes command.
#[derive(Debug, Serialize)]
pub struct RoutesOutput {
    pub via: String,
    pub routes: Vec<RouteLine>,
    pub unreachable: Vec<String>,
    pub probes: usize,
}

impl Render for RoutesOutput {
    fn render_human(&self) -> String {
        let mut lines = vec![format!(
            "{} through {} ({} listings)",
            "Routes".bold(),
            self.via,
            self.probes
        )];
        for route in &self.routes {
            match &route.via {
                Some(via) => lines.push(format!("  {} <- {}", route.node, via)),
                None => lines.push(format!("  {} {}", route.node, "(direct)".dimmed())),
            }
        }
        if !self.unreachable.is_empty() {
            lines.push(format!("{}", "Unreachable:".yellow().bold()));
            for node in &self.unreachable {
                lines.push(format!("  {}", node));
            }
        }
        lines.join("\n")
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_types::NodeId;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("TEXT".parse::<OutputFormat>().unwrap(), OutputFormat::Human);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_whoami_output() {
        let output = WhoamiOutput {
            node_id: "0123456789abcdef0123456789abcdef".into(),
            display_name: "Build Server".into(),
            workflow_host: true,
            legacy_id: None,
            contact_points: vec![],
        };
        let human = output.render(OutputFormat::Human);
        assert!(human.contains("Node ID"));
        assert!(human.contains("client only"));

        let json = output.render(OutputFormat::Json);
        assert!(json.contains("\"workflow_host\": true"));
        assert!(!json.contains("legacy_id"));
    }

    #[test]
    fn test_ping_average() {
        let mut output = PingOutput {
            contact_point: "broker:127.0.0.1:21000".into(),
            node_id: "aaa".into(),
            display_name: "A".into(),
            round_trips_ms: vec![],
        };
        assert!(output.average_ms().is_none());

        output.round_trips_ms = vec![1.0, 3.0];
        assert_eq!(output.average_ms(), Some(2.0));
        assert!(output.render(OutputFormat::Human).contains("Average"));
    }

    #[test]
    fn test_peers_output() {
        let output = PeersOutput {
            via: "broker:127.0.0.1:21000".into(),
            nodes: vec![NetworkStateNode {
                node_id: NodeId::new("bbb").unwrap(),
                display_name: "B".into(),
                is_workflow_host: true,
                is_local_node: false,
            }],
        };
        assert!(output.render(OutputFormat::Human).contains("workflow host"));
        assert!(output.render(OutputFormat::Json).contains("\"node_id\": \"bbb\""));

        let empty = PeersOutput {
            via: "x".into(),
            nodes: vec![],
        };
        assert!(empty.render(OutputFormat::Human).starts_with("No nodes"));
    }
}
