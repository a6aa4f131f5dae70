//! Fixed pool back-end
//!
//! Agents are assigned from a declared list of machines that are already
//! running. The back-end never owns machine power state: stopping and
//! destroying an agent only hands its address back to the pool.

use crate::clusterable::{Clusterable, FleetContext};
use crate::error::{FleetError, Result};
use crate::lifecycle::LoadAgent;
use crate::models::{ClusterConfig, ClusterableKind, TestPlan};
use crate::session::{SshAccess, SshAuth};
use crate::verifier::Prerequisites;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Identity file used when none is configured
pub const DEFAULT_IDENTITY: &str = "server.pem";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedPoolConfig {
    pub id: String,
    /// Data center name
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_identity")]
    pub ssh_identity: String,
    #[serde(default)]
    pub machines: Vec<String>,
    #[serde(default)]
    pub max_threads_per_agent: Option<u32>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_title() -> String {
    "Fixed pool".to_string()
}

pub(crate) fn default_user_name() -> String {
    "ubuntu".to_string()
}

fn default_identity() -> String {
    DEFAULT_IDENTITY.to_string()
}

pub(crate) fn default_ssh_port() -> u16 {
    22
}

impl FixedPoolConfig {
    pub fn new(id: impl Into<String>, machines: Vec<String>) -> Self {
        Self {
            id: id.into(),
            title: default_title(),
            active: true,
            user_name: default_user_name(),
            ssh_identity: default_identity(),
            machines,
            max_threads_per_agent: None,
            ssh_port: default_ssh_port(),
        }
    }
}

pub struct FixedPool {
    id: String,
    config: RwLock<FixedPoolConfig>,
    available: Mutex<VecDeque<String>>,
    prerequisites: Prerequisites,
    ctx: FleetContext,
}

impl FixedPool {
    /// Build the pool; machines held by stored agents are not available
    pub fn new(config: FixedPoolConfig, prerequisites: Prerequisites, ctx: FleetContext) -> Result<Self> {
        let held: HashSet<String> = ctx
            .store
            .load_agents(&config.id)?
            .into_iter()
            .filter(|a| a.has_address())
            .filter_map(|a| a.identifier)
            .collect();

        let available = config
            .machines
            .iter()
            .filter(|m| !held.contains(*m))
            .cloned()
            .collect();

        Ok(Self {
            id: config.id.clone(),
            config: RwLock::new(config),
            available: Mutex::new(available),
            prerequisites,
            ctx,
        })
    }

    fn take_machine(&self) -> Result<String> {
        let mut available = self
            .available
            .lock()
            .map_err(|_| FleetError::validation("machine pool lock poisoned"))?;
        available.pop_front().ok_or_else(|| FleetError::PoolExhausted {
            clusterable: self.id.clone(),
        })
    }

    fn return_machine(&self, address: &str) {
        if let Ok(mut available) = self.available.lock() {
            if !available.iter().any(|m| m == address) {
                available.push_back(address.to_string());
            }
        }
    }

    /// Machines not assigned to any agent
    pub fn available_machines(&self) -> Vec<String> {
        self.available
            .lock()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn access_failure(&self, host: &str) -> FleetError {
        let access = self.ssh_access().await;
        FleetError::AccessFailure {
            user: access.user,
            host: host.to_string(),
            identity: access.auth.identity_file.display().to_string(),
        }
    }

    /// Connectivity check and prerequisite verification on one machine
    async fn check_machine(&self, address: &str) -> Result<()> {
        let access = self.ssh_access().await;
        if !access.auth.identity_file.exists() {
            return Err(self.access_failure(address).await);
        }

        let mut session = match self
            .ctx
            .sessions
            .open(address, &access.user, &access.auth)
            .await
        {
            Ok(session) => session,
            Err(e) if e.is_transient() => {
                warn!(clusterable = %self.id, host = %address, error = %e, "Machine not accessible");
                return Err(self.access_failure(address).await);
            }
            Err(e) => return Err(e),
        };

        let outcome = async {
            session.exec_checked("ls").await?;
            self.ctx
                .verifier
                .verify(session.as_mut(), &self.prerequisites)
                .await
        }
        .await;

        session.close().await?;
        outcome
    }
}

#[async_trait]
impl Clusterable for FixedPool {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ClusterableKind {
        ClusterableKind::FixedPool
    }

    fn context(&self) -> &FleetContext {
        &self.ctx
    }

    async fn slug(&self) -> String {
        format!("Fixed pool, data center: {}", self.config.read().await.title)
    }

    async fn is_active(&self) -> bool {
        self.config.read().await.active
    }

    async fn config(&self) -> ClusterConfig {
        ClusterConfig::FixedPool(self.config.read().await.clone())
    }

    async fn ssh_access(&self) -> SshAccess {
        let config = self.config.read().await;
        SshAccess {
            user: config.user_name.clone(),
            auth: SshAuth::new(self.ctx.settings.resolve_identity(&config.ssh_identity))
                .port(config.ssh_port)
                .connect_timeout(self.ctx.settings.ssh_connect_timeout()),
        }
    }

    async fn validate(&self) -> Result<()> {
        let config = self.config.read().await.clone();
        if !config.active {
            return Ok(());
        }

        if config.user_name.trim().is_empty() {
            return Err(FleetError::validation(format!(
                "{}: user name is required",
                config.id
            )));
        }
        if config.machines.is_empty() {
            return Err(FleetError::validation(format!(
                "{}: at least one machine is required",
                config.id
            )));
        }
        let identity = self.ctx.settings.resolve_identity(&config.ssh_identity);
        if !identity.exists() {
            return Err(FleetError::validation(format!(
                "{}: identity file {} not found",
                config.id,
                identity.display()
            )));
        }
        Ok(())
    }

    async fn required_load_agent_count(&self, _plan: &TestPlan) -> usize {
        self.config.read().await.machines.len()
    }

    async fn start_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        let address = self.take_machine()?;
        debug!(clusterable = %self.id, agent_id = %agent.id, host = %address, "Assigning machine");

        if let Err(e) = self.check_machine(&address).await {
            self.return_machine(&address);
            return Err(e);
        }

        agent.mark_reachable(address.clone(), Some(address.clone()), address)?;
        Ok(())
    }

    async fn stop_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        debug!(clusterable = %self.id, agent_id = %agent.id, "Machines are not stopped");
        Ok(())
    }

    async fn release_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        let address = agent.private_ip_address.clone();
        agent.release(false)?;
        if let Some(address) = address {
            self.return_machine(&address);
        }
        Ok(())
    }

    async fn before_destroy_load_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        debug!(clusterable = %self.id, agent_id = %agent.id, "Machines are not destroyed");
        Ok(())
    }

    /// Remove the application working directory and return the machine
    async fn after_destroy_load_agent(&self, agent: &LoadAgent) -> Result<()> {
        let address = match agent.private_ip_address.as_deref() {
            Some(address) => address,
            None => return Ok(()),
        };

        let access = self.ssh_access().await;
        let mut session = self
            .ctx
            .sessions
            .open(address, &access.user, &access.auth)
            .await?;
        let result = session
            .exec(&format!("rm -r -v -f ~/{}", self.ctx.settings.app_name))
            .await;
        session.close().await?;
        result?;

        self.return_machine(address);
        info!(clusterable = %self.id, host = %address, "Machine returned to pool");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        debug!(clusterable = %self.id, "Nothing to clean up on a fixed pool");
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        debug!(clusterable = %self.id, "Nothing to purge on a fixed pool");
        Ok(())
    }
}
