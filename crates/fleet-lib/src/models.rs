//! Core data models for fleet orchestration

use crate::elastic::ElasticComputeConfig;
use crate::fixed_pool::FixedPoolConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default runtime version required on every load agent
pub const DEFAULT_RUNTIME_VERSION: &str = "1.8";

/// Default load-generation tool version
pub const DEFAULT_TOOL_VERSION: &str = "5.4.1";

/// Discriminator of a provisioning back-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterableKind {
    ElasticCompute,
    FixedPool,
}

impl fmt::Display for ClusterableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterableKind::ElasticCompute => write!(f, "elastic_compute"),
            ClusterableKind::FixedPool => write!(f, "fixed_pool"),
        }
    }
}

/// Stored configuration of one clusterable, tagged by back-end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterConfig {
    ElasticCompute(ElasticComputeConfig),
    FixedPool(FixedPoolConfig),
}

impl ClusterConfig {
    pub fn kind(&self) -> ClusterableKind {
        match self {
            ClusterConfig::ElasticCompute(_) => ClusterableKind::ElasticCompute,
            ClusterConfig::FixedPool(_) => ClusterableKind::FixedPool,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ClusterConfig::ElasticCompute(c) => &c.id,
            ClusterConfig::FixedPool(c) => &c.id,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ClusterConfig::ElasticCompute(c) => c.active,
            ClusterConfig::FixedPool(c) => c.active,
        }
    }
}

/// One thread group of a test plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadGroup {
    pub name: String,
    pub num_threads: u32,
}

/// Thread configuration of a test plan, as far as fleet sizing cares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub name: String,
    #[serde(default)]
    pub thread_groups: Vec<ThreadGroup>,
}

impl TestPlan {
    pub fn new(name: impl Into<String>, thread_groups: Vec<ThreadGroup>) -> Self {
        Self {
            name: name.into(),
            thread_groups,
        }
    }

    /// Total threads across all thread groups
    pub fn num_threads(&self) -> u32 {
        self.thread_groups
            .iter()
            .fold(0u32, |total, g| total.saturating_add(g.num_threads))
    }

    pub fn thread_group_count(&self) -> usize {
        self.thread_groups.len()
    }
}

/// Load-generation tool required on every agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default = "default_tool_version")]
    pub version: String,
    /// Installation directory on agents; derived from the version if absent
    #[serde(default)]
    pub home: Option<String>,
    /// Custom installer archive; the default distribution is used if absent
    #[serde(default)]
    pub installer_url: Option<String>,
}

fn default_tool_version() -> String {
    DEFAULT_TOOL_VERSION.to_string()
}

impl Default for ToolSpec {
    fn default() -> Self {
        Self {
            version: default_tool_version(),
            home: None,
            installer_url: None,
        }
    }
}

impl ToolSpec {
    /// Name of the expanded installation directory
    pub fn directory(&self) -> String {
        match &self.installer_url {
            Some(url) => {
                let file = url.rsplit('/').next().unwrap_or(url);
                file.trim_end_matches(".tgz")
                    .trim_end_matches(".tar.gz")
                    .to_string()
            }
            None => format!("apache-jmeter-{}", self.version),
        }
    }

    /// Installation directory on the agent
    pub fn home_dir(&self) -> String {
        self.home
            .clone()
            .unwrap_or_else(|| format!("$HOME/{}", self.directory()))
    }

    pub fn download_url(&self) -> String {
        match &self.installer_url {
            Some(url) => url.clone(),
            None => format!(
                "https://archive.apache.org/dist/jmeter/binaries/apache-jmeter-{}.tgz",
                self.version
            ),
        }
    }

    /// Whether the installer is a project-specific build
    pub fn is_custom(&self) -> bool {
        self.installer_url.is_some()
    }
}

/// Project parameters the orchestrator needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub code: String,
    #[serde(default)]
    pub tool: ToolSpec,
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,
    #[serde(default)]
    pub test_plans: Vec<TestPlan>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

fn default_runtime_version() -> String {
    DEFAULT_RUNTIME_VERSION.to_string()
}

impl Project {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            tool: ToolSpec::default(),
            runtime_version: default_runtime_version(),
            test_plans: Vec::new(),
            clusters: Vec::new(),
        }
    }

    /// Total thread count across all test plans
    pub fn total_threads(&self) -> u32 {
        self.test_plans
            .iter()
            .fold(0u32, |total, plan| total.saturating_add(plan.num_threads()))
    }
}

/// Status of one execution cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Stopped,
    Aborted,
    Failed,
    Excluded,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Started => "started",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Aborted => "aborted",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Excluded => "excluded",
        };
        write!(f, "{}", s)
    }
}

/// One timed run of distributed load generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCycle {
    pub id: u64,
    pub project_code: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub threads_count: u32,
}

impl ExecutionCycle {
    pub fn start(id: u64, project_code: impl Into<String>, threads_count: u32) -> Self {
        Self {
            id,
            project_code: project_code.into(),
            status: ExecutionStatus::Started,
            started_at: Utc::now(),
            stopped_at: None,
            threads_count,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ExecutionStatus::Started
    }

    pub fn stop(&mut self) {
        self.close(ExecutionStatus::Stopped);
    }

    pub fn abort(&mut self) {
        self.close(ExecutionStatus::Aborted);
    }

    pub fn fail(&mut self) {
        self.close(ExecutionStatus::Failed);
    }

    fn close(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.stopped_at = Some(Utc::now());
    }
}
