//! CLI integration tests

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn fleet(args: &[&str], config_dir: Option<&Path>) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_fleet"));
    command.args(args).env_remove("FLEET_PROJECT").env_remove("FLEET_SETTINGS");
    if let Some(dir) = config_dir {
        command.env("FLEET_CONFIG_DIR", dir);
    }
    command.output().expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = fleet(&["--help"], None);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(
        stdout.contains("load-testing agents"),
        "Should show app description"
    );
    for command in ["setup", "start", "stop", "abort", "terminate", "purge", "status", "check"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = fleet(&["--version"], None);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("fleet"), "Should show binary name");
}

/// Test setup command help
#[test]
fn test_setup_help() {
    let output = fleet(&["setup", "--help"], None);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Setup help should succeed");
    assert!(stdout.contains("--force"), "Should show force option");
}

/// Test stop command help
#[test]
fn test_stop_help() {
    let output = fleet(&["stop", "--help"], None);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Stop help should succeed");
    assert!(stdout.contains("--suspend"), "Should show suspend option");
}

/// Test check command help
#[test]
fn test_check_help() {
    let output = fleet(&["check", "--help"], None);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Check help should succeed");
    assert!(stdout.contains("<HOST>"), "Should show host argument");
    assert!(stdout.contains("--identity"), "Should show identity option");
}

/// Test that a missing project file is reported
#[test]
fn test_missing_project_file() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("missing.json");
    let output = fleet(
        &["--project", project.to_str().unwrap(), "status"],
        Some(dir.path()),
    );

    assert!(!output.status.success(), "Status without a project should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read project file"));
}

/// Test status of a project that was never set up
#[test]
fn test_status_of_fresh_project() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("fleet.json");
    std::fs::write(
        &project,
        r#"{
            "code": "acme",
            "test_plans": [{"name": "shop", "thread_groups": [{"name": "browse", "num_threads": 10}]}],
            "clusters": [
                {"kind": "fixed_pool", "id": "dc-1", "title": "Lab", "active": true, "machines": ["10.0.0.1"]}
            ]
        }"#,
    )
    .unwrap();

    let output = fleet(
        &["--project", project.to_str().unwrap(), "--format", "json", "status"],
        Some(dir.path()),
    );
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Status should succeed");
    assert!(stdout.contains("Fixed pool, data center: Lab"));
    assert!(stdout.contains("\"current_cycle\": null"));
}
