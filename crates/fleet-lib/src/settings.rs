//! Runtime settings shared by every clusterable

use crate::wait::WaitOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for every artifact the fleet creates in a compute account
pub const ARTIFACT_PREFIX: &str = "loadfleet";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    /// Upper bound on concurrent provisioning workflows per clusterable
    #[serde(default = "default_max_parallel_provisioning")]
    pub max_parallel_provisioning: usize,

    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    #[serde(default = "default_instance_ready_timeout_secs")]
    pub instance_ready_timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_instance_poll_interval_secs")]
    pub instance_poll_interval_secs: u64,

    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub ssh_connect_timeout_secs: u64,

    /// Directory relative identity files are resolved against
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Working directory name on agents, also part of generated key names
    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_max_parallel_provisioning() -> usize {
    5
}

fn default_wait_timeout_secs() -> u64 {
    300
}

fn default_instance_ready_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_instance_poll_interval_secs() -> u64 {
    10
}

fn default_ssh_connect_timeout_secs() -> u64 {
    10
}

fn default_config_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_app_name() -> String {
    "load_fleet".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("fleet-state.json")
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            max_parallel_provisioning: default_max_parallel_provisioning(),
            wait_timeout_secs: default_wait_timeout_secs(),
            instance_ready_timeout_secs: default_instance_ready_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            instance_poll_interval_secs: default_instance_poll_interval_secs(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout_secs(),
            config_dir: default_config_dir(),
            app_name: default_app_name(),
            state_file: default_state_file(),
        }
    }
}

impl FleetSettings {
    /// Budget for ordinary waits (reachability, process exit, stop)
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::new(
            Duration::from_secs(self.wait_timeout_secs),
            Duration::from_secs(self.poll_interval_secs),
        )
    }

    /// Budget for instances to boot and images to become available
    pub fn instance_ready_options(&self) -> WaitOptions {
        WaitOptions::new(
            Duration::from_secs(self.instance_ready_timeout_secs),
            Duration::from_secs(self.instance_poll_interval_secs),
        )
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn parallelism(&self) -> usize {
        self.max_parallel_provisioning.max(1)
    }

    /// Absolute identity paths are used as-is, relative ones live in `config_dir`
    pub fn resolve_identity(&self, identity: &str) -> PathBuf {
        self.resolve(Path::new(identity))
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.state_file)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = FleetSettings::default();
        assert_eq!(settings.max_parallel_provisioning, 5);
        assert_eq!(settings.instance_ready_options().timeout, Duration::from_secs(600));
        assert_eq!(settings.wait_options().poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let settings: FleetSettings =
            serde_json::from_str(r#"{"instance_ready_timeout_secs": 900}"#).unwrap();
        assert_eq!(settings.instance_ready_timeout_secs, 900);
        assert_eq!(settings.wait_timeout_secs, 300);
        assert_eq!(settings.app_name, "load_fleet");
    }

    #[test]
    fn test_identity_resolution() {
        let settings = FleetSettings {
            config_dir: PathBuf::from("/etc/fleet"),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve_identity("server.pem"),
            PathBuf::from("/etc/fleet/server.pem")
        );
        assert_eq!(
            settings.resolve_identity("/keys/lab.pem"),
            PathBuf::from("/keys/lab.pem")
        );
        assert_eq!(
            settings.state_path(),
            PathBuf::from("/etc/fleet/fleet-state.json")
        );
    }

    #[test]
    fn test_parallelism_never_zero() {
        let settings = FleetSettings {
            max_parallel_provisioning: 0,
            ..Default::default()
        };
        assert_eq!(settings.parallelism(), 1);
    }
}
