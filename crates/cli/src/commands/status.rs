//! Fleet status command

use anyhow::Result;
use colored::Colorize;
use fleet_lib::{ClusterStatus, LoadAgent};
use serde::Serialize;
use tabled::Tabled;

use crate::config::FleetRuntime;
use crate::output::{
    color_status, format_optional, format_timestamp, print_json, print_table, print_warning,
    OutputFormat,
};

/// Row for the agents table
#[derive(Tabled, Serialize)]
struct AgentRow {
    #[tabled(rename = "Agent")]
    id: String,
    #[tabled(rename = "Plan")]
    test_plan: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Identifier")]
    identifier: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "PID")]
    process_id: String,
    #[tabled(rename = "Active")]
    active: bool,
}

impl From<&LoadAgent> for AgentRow {
    fn from(agent: &LoadAgent) -> Self {
        Self {
            id: agent.id.clone(),
            test_plan: agent.test_plan.clone(),
            state: color_status(&agent.state.to_string()),
            identifier: format_optional(agent.identifier.as_deref()),
            address: format_optional(agent.ssh_address()),
            process_id: agent
                .process_id
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            active: agent.active,
        }
    }
}

fn print_cluster(status: &ClusterStatus) {
    let marker = if status.active {
        "active".green()
    } else {
        "inactive".yellow()
    };
    println!(
        "{} [{}] {}: {} reachable, {} generating",
        status.slug.bold(),
        marker,
        status.id.cyan(),
        status.reachable(),
        status.generating()
    );
}

pub async fn show_status(runtime: &FleetRuntime, format: OutputFormat) -> Result<()> {
    let clusters = runtime.orchestrator.status().await?;
    let cycle = runtime.orchestrator.current_cycle()?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "project": runtime.orchestrator.project().code,
            "clusters": clusters,
            "current_cycle": cycle,
        })),
        OutputFormat::Table => {
            println!(
                "{} {}",
                "Project".bold(),
                runtime.orchestrator.project().code.cyan()
            );
            println!("{}", "=".repeat(60));

            if clusters.is_empty() {
                print_warning("No clusterables configured");
                return Ok(());
            }

            for status in &clusters {
                print_cluster(status);
                let rows: Vec<AgentRow> = status.agents.iter().map(AgentRow::from).collect();
                print_table(&rows, format);
                println!();
            }

            match cycle {
                Some(cycle) => println!(
                    "Execution cycle {} {} since {}",
                    cycle.id,
                    color_status(&cycle.status.to_string()),
                    format_timestamp(&cycle.started_at)
                ),
                None => println!("No execution cycle running"),
            }
        }
    }
    Ok(())
}
