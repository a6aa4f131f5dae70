//! Fleet lifecycle commands

use anyhow::{Context, Result};
use fleet_lib::account_cleanup::PurgeReport;
use fleet_lib::{ExecutionCycle, StopOptions};
use serde::Serialize;
use tabled::Tabled;

use crate::config::FleetRuntime;
use crate::output::{
    color_status, format_timestamp, print_info, print_json, print_success, print_table,
    print_warning, OutputFormat,
};

/// Row for the cycle table
#[derive(Tabled, Serialize)]
struct CycleRow {
    #[tabled(rename = "Cycle")]
    id: u64,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Threads")]
    threads: u32,
    #[tabled(rename = "Started")]
    started_at: String,
    #[tabled(rename = "Stopped")]
    stopped_at: String,
}

impl From<&ExecutionCycle> for CycleRow {
    fn from(cycle: &ExecutionCycle) -> Self {
        Self {
            id: cycle.id,
            status: color_status(&cycle.status.to_string()),
            threads: cycle.threads_count,
            started_at: format_timestamp(&cycle.started_at),
            stopped_at: cycle
                .stopped_at
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Row for the purge table
#[derive(Tabled, Serialize)]
struct PurgeRow {
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Instances")]
    instances: usize,
    #[tabled(rename = "Images")]
    images: usize,
    #[tabled(rename = "Key pairs")]
    key_pairs: usize,
    #[tabled(rename = "Security groups")]
    security_groups: usize,
}

impl From<&PurgeReport> for PurgeRow {
    fn from(report: &PurgeReport) -> Self {
        Self {
            region: report.region.clone(),
            instances: report.instances_terminated,
            images: report.images_deregistered,
            key_pairs: report.key_pairs_deleted,
            security_groups: report.security_groups_deleted,
        }
    }
}

fn print_cycle(cycle: &ExecutionCycle, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(cycle),
        OutputFormat::Table => print_table(&[CycleRow::from(cycle)], format),
    }
}

pub async fn setup(runtime: &FleetRuntime, force: bool, format: OutputFormat) -> Result<()> {
    print_info("Setting up load agents...");
    runtime
        .orchestrator
        .setup(force)
        .await
        .context("Fleet setup failed")?;

    let required = runtime.orchestrator.required_load_agent_count().await;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "required_load_agents": required })),
        OutputFormat::Table => {
            print_success(&format!("Fleet ready with {} load agent(s)", required));
        }
    }
    Ok(())
}

pub async fn start(runtime: &FleetRuntime, format: OutputFormat) -> Result<()> {
    print_info("Starting load generation...");
    let cycle = runtime
        .orchestrator
        .start(&runtime.generator)
        .await
        .context("Failed to start load generation")?;
    print_cycle(&cycle, format);
    Ok(())
}

pub async fn stop(runtime: &FleetRuntime, suspend: bool, format: OutputFormat) -> Result<()> {
    let options = StopOptions {
        suspend,
        aborted: false,
    };
    let cycle = runtime
        .orchestrator
        .stop(&runtime.generator, options)
        .await
        .context("Failed to stop load generation")?;
    if suspend {
        print_info("Load agents released");
    }
    print_cycle(&cycle, format);
    Ok(())
}

pub async fn abort(runtime: &FleetRuntime, format: OutputFormat) -> Result<()> {
    let cycle = runtime
        .orchestrator
        .abort(&runtime.generator)
        .await
        .context("Failed to abort load generation")?;
    print_warning(&format!("Execution cycle {} aborted", cycle.id));
    print_cycle(&cycle, format);
    Ok(())
}

pub async fn terminate(runtime: &FleetRuntime) -> Result<()> {
    runtime
        .orchestrator
        .terminate(&runtime.generator)
        .await
        .context("Failed to terminate fleet")?;
    print_success("All load agents destroyed");
    Ok(())
}

pub async fn purge(runtime: &FleetRuntime, format: OutputFormat) -> Result<()> {
    print_warning("Purging every fleet artifact from the configured accounts");
    let reports = runtime
        .orchestrator
        .purge()
        .await
        .context("Account purge failed")?;

    let rows: Vec<PurgeRow> = reports.iter().map(PurgeRow::from).collect();
    print_table(&rows, format);
    if matches!(format, OutputFormat::Table) {
        let total: usize = reports.iter().map(PurgeReport::total).sum();
        print_success(&format!("Removed {} artifact(s)", total));
    }
    Ok(())
}
