//! Persistence of agents, clusterable configurations and execution cycles
//!
//! The orchestration core only sees the [`FleetStore`] trait. The in-memory
//! store backs tests and one-shot runs; the JSON file store keeps state
//! across CLI invocations.

use crate::error::{FleetError, Result};
use crate::lifecycle::LoadAgent;
use crate::models::{ClusterConfig, ExecutionCycle};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub trait FleetStore: Send + Sync {
    /// Agents of one clusterable, ordered by id
    fn load_agents(&self, clusterable_id: &str) -> Result<Vec<LoadAgent>>;

    fn save_agent(&self, agent: &LoadAgent) -> Result<()>;

    fn delete_agent(&self, agent_id: &str) -> Result<()>;

    fn load_cluster(&self, clusterable_id: &str) -> Result<Option<ClusterConfig>>;

    fn save_cluster(&self, config: &ClusterConfig) -> Result<()>;

    /// Execution cycles, oldest first
    fn load_cycles(&self) -> Result<Vec<ExecutionCycle>>;

    fn save_cycle(&self, cycle: &ExecutionCycle) -> Result<()>;

    /// Open cycle, if any
    fn current_cycle(&self) -> Result<Option<ExecutionCycle>> {
        Ok(self.load_cycles()?.into_iter().rev().find(|c| c.is_open()))
    }
}

/// Concurrent in-memory store
#[derive(Default)]
pub struct InMemoryStore {
    agents: DashMap<String, LoadAgent>,
    clusters: DashMap<String, ClusterConfig>,
    cycles: DashMap<u64, ExecutionCycle>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut agents: Vec<LoadAgent> = self.agents.iter().map(|r| r.value().clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        let mut clusters: Vec<ClusterConfig> =
            self.clusters.iter().map(|r| r.value().clone()).collect();
        clusters.sort_by(|a, b| a.id().cmp(b.id()));
        let mut cycles: Vec<ExecutionCycle> =
            self.cycles.iter().map(|r| r.value().clone()).collect();
        cycles.sort_by_key(|c| c.id);

        StoreSnapshot {
            agents,
            clusters,
            cycles,
        }
    }

    fn restore(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        for agent in snapshot.agents {
            store.agents.insert(agent.id.clone(), agent);
        }
        for cluster in snapshot.clusters {
            store.clusters.insert(cluster.id().to_string(), cluster);
        }
        for cycle in snapshot.cycles {
            store.cycles.insert(cycle.id, cycle);
        }
        store
    }
}

impl FleetStore for InMemoryStore {
    fn load_agents(&self, clusterable_id: &str) -> Result<Vec<LoadAgent>> {
        let mut agents: Vec<LoadAgent> = self
            .agents
            .iter()
            .filter(|r| r.value().clusterable_id == clusterable_id)
            .map(|r| r.value().clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    fn save_agent(&self, agent: &LoadAgent) -> Result<()> {
        debug!(agent_id = %agent.id, state = %agent.state, "Saving load agent");
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    fn delete_agent(&self, agent_id: &str) -> Result<()> {
        debug!(agent_id = %agent_id, "Deleting load agent");
        self.agents.remove(agent_id);
        Ok(())
    }

    fn load_cluster(&self, clusterable_id: &str) -> Result<Option<ClusterConfig>> {
        Ok(self.clusters.get(clusterable_id).map(|r| r.clone()))
    }

    fn save_cluster(&self, config: &ClusterConfig) -> Result<()> {
        self.clusters
            .insert(config.id().to_string(), config.clone());
        Ok(())
    }

    fn load_cycles(&self) -> Result<Vec<ExecutionCycle>> {
        let mut cycles: Vec<ExecutionCycle> =
            self.cycles.iter().map(|r| r.value().clone()).collect();
        cycles.sort_by_key(|c| c.id);
        Ok(cycles)
    }

    fn save_cycle(&self, cycle: &ExecutionCycle) -> Result<()> {
        self.cycles.insert(cycle.id, cycle.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    agents: Vec<LoadAgent>,
    #[serde(default)]
    clusters: Vec<ClusterConfig>,
    #[serde(default)]
    cycles: Vec<ExecutionCycle>,
}

/// Store that writes every change through to a JSON file
pub struct JsonFileStore {
    path: PathBuf,
    inner: InMemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store, loading existing state if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = if path.exists() {
            let data = std::fs::read(&path)?;
            let snapshot: StoreSnapshot = serde_json::from_slice(&data)?;
            info!(
                path = %path.display(),
                agents = snapshot.agents.len(),
                cycles = snapshot.cycles.len(),
                "Loaded fleet state"
            );
            InMemoryStore::restore(snapshot)
        } else {
            InMemoryStore::new()
        };

        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| FleetError::store("state file lock poisoned"))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(&self.inner.snapshot())?;

        // Write atomically using temp file
        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl FleetStore for JsonFileStore {
    fn load_agents(&self, clusterable_id: &str) -> Result<Vec<LoadAgent>> {
        self.inner.load_agents(clusterable_id)
    }

    fn save_agent(&self, agent: &LoadAgent) -> Result<()> {
        self.inner.save_agent(agent)?;
        self.flush()
    }

    fn delete_agent(&self, agent_id: &str) -> Result<()> {
        self.inner.delete_agent(agent_id)?;
        self.flush()
    }

    fn load_cluster(&self, clusterable_id: &str) -> Result<Option<ClusterConfig>> {
        self.inner.load_cluster(clusterable_id)
    }

    fn save_cluster(&self, config: &ClusterConfig) -> Result<()> {
        self.inner.save_cluster(config)?;
        self.flush()
    }

    fn load_cycles(&self) -> Result<Vec<ExecutionCycle>> {
        self.inner.load_cycles()
    }

    fn save_cycle(&self, cycle: &ExecutionCycle) -> Result<()> {
        self.inner.save_cycle(cycle)?;
        self.flush()
    }
}
