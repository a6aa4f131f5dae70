//! Clusterable abstraction
//!
//! A clusterable is one provisioning back-end configured for a project. The
//! trait carries the full capability set; default methods hold the
//! workflows shared by every back-end (count reconciliation, bounded
//! provisioning, suspend, destroy) and call into the back-end hooks.

use crate::error::{FleetError, Result};
use crate::lifecycle::{AgentState, LoadAgent};
use crate::models::{ClusterConfig, ClusterableKind, TestPlan};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::session::{SessionFactory, SshAccess};
use crate::settings::FleetSettings;
use crate::store::FleetStore;
use crate::verifier::Verifier;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Collaborators shared by every clusterable of a project
#[derive(Clone)]
pub struct FleetContext {
    pub settings: Arc<FleetSettings>,
    pub store: Arc<dyn FleetStore>,
    pub sessions: Arc<dyn SessionFactory>,
    pub verifier: Arc<dyn Verifier>,
    pub metrics: FleetMetrics,
    pub logger: StructuredLogger,
}

impl FleetContext {
    pub fn new(
        settings: FleetSettings,
        store: Arc<dyn FleetStore>,
        sessions: Arc<dyn SessionFactory>,
        verifier: Arc<dyn Verifier>,
        project_code: &str,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            sessions,
            verifier,
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new(project_code),
        }
    }
}

/// How load generation was stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Release agent machines after stopping
    pub suspend: bool,
    /// Stopped by abort rather than a regular stop
    pub aborted: bool,
}

/// Drive `futures` with at most `limit` in flight. After the first error no
/// new future is started, but those already in flight run to completion so
/// their agents are persisted in a consistent state. The first error wins.
pub async fn run_bounded<I, Fut>(futures: I, limit: usize) -> Result<()>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<()>>,
{
    let mut queued = futures.into_iter();
    let mut in_flight = FuturesUnordered::new();
    in_flight.extend(queued.by_ref().take(limit.max(1)));

    let mut first_error = None;
    while let Some(result) = in_flight.next().await {
        match result {
            Ok(()) => {
                if first_error.is_none() {
                    if let Some(next) = queued.next() {
                        in_flight.push(next);
                    }
                }
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn failure_reason(err: &FleetError) -> &'static str {
    match err {
        FleetError::ConnectionFailure { .. } | FleetError::AuthFailure { .. } => "connection",
        FleetError::AccessFailure { .. } => "access",
        FleetError::RuntimeVersionFailure { .. } => "runtime_version",
        FleetError::ToolVersionFailure { .. } => "tool_version",
        FleetError::OperationTimeout { .. } => "timeout",
        FleetError::CloudApiFailure { .. } => "cloud_api",
        FleetError::PoolExhausted { .. } => "pool_exhausted",
        _ => "other",
    }
}

#[async_trait]
pub trait Clusterable: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ClusterableKind;

    fn context(&self) -> &FleetContext;

    /// Human readable description
    async fn slug(&self) -> String;

    async fn is_active(&self) -> bool;

    /// Current configuration, as persisted
    async fn config(&self) -> ClusterConfig;

    /// User and identity for sessions to this clusterable's machines
    async fn ssh_access(&self) -> SshAccess;

    /// Check the configuration; invalid configuration is a `Validation` error
    async fn validate(&self) -> Result<()>;

    /// Create back-end artifacts agents depend on (keys, images)
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Number of agents needed to run `plan`
    async fn required_load_agent_count(&self, plan: &TestPlan) -> usize;

    /// Create or assign a machine for `agent` and make it `Reachable`.
    /// Called with the agent in `Provisioning`.
    async fn start_agent(&self, agent: &mut LoadAgent) -> Result<()>;

    /// Stop the agent machine, keeping it for a later restart
    async fn stop_agent(&self, agent: &mut LoadAgent) -> Result<()>;

    /// Release the agent machine for good
    async fn before_destroy_load_agent(&self, agent: &mut LoadAgent) -> Result<()>;

    async fn after_destroy_load_agent(&self, _agent: &LoadAgent) -> Result<()> {
        Ok(())
    }

    /// Remove credentials and artifacts no longer needed
    async fn cleanup(&self) -> Result<()>;

    /// Remove every artifact the fleet created through this clusterable
    async fn purge(&self) -> Result<()>;

    /// Forget cached references to purged artifacts
    async fn forget_artifacts(&self) -> Result<()> {
        Ok(())
    }

    /// Drop the machine and addresses of a stopped agent
    async fn release_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        agent.release(true)
    }

    /// Validate, persist and, when active or forced, scale the fleet
    async fn setup(&self, plans: &[TestPlan], force: bool) -> Result<()> {
        debug!(clusterable = %self.id(), force = force, "Setting up clusterable");
        self.validate().await?;
        self.context().store.save_cluster(&self.config().await)?;

        if self.is_active().await || force {
            self.prepare().await?;
            self.context().store.save_cluster(&self.config().await)?;
            self.provision_agents(plans).await?;
        }
        Ok(())
    }

    /// Reconcile agent counts per test plan, then start agents lacking an address
    async fn provision_agents(&self, plans: &[TestPlan]) -> Result<()> {
        let store = self.context().store.clone();

        for plan in plans {
            let required = self.required_load_agent_count(plan).await;
            let all_agents = store.load_agents(self.id())?;
            let mut taken_ids: HashSet<String> = all_agents.iter().map(|a| a.id.clone()).collect();

            let (active, inactive): (Vec<LoadAgent>, Vec<LoadAgent>) = all_agents
                .into_iter()
                .filter(|a| a.test_plan == plan.name)
                .partition(|a| a.active);

            debug!(
                clusterable = %self.id(),
                plan = %plan.name,
                required = required,
                active = active.len(),
                "Reconciling load agents"
            );

            if active.len() > required {
                for mut agent in active.into_iter().skip(required) {
                    self.destroy_load_agent(&mut agent).await?;
                }
                continue;
            }

            let mut missing = required - active.len();
            for mut agent in inactive.into_iter().take(missing) {
                agent.active = true;
                store.save_agent(&agent)?;
                missing -= 1;
            }

            let mut seq = 1;
            while missing > 0 {
                let id = format!("{}-{}-{}", self.id(), plan.name, seq);
                seq += 1;
                if taken_ids.contains(&id) {
                    continue;
                }
                store.save_agent(&LoadAgent::new(id.clone(), self.id(), plan.name.clone()))?;
                taken_ids.insert(id);
                missing -= 1;
            }
        }

        self.before_generate_load().await
    }

    /// Start every active agent lacking a live address, at most
    /// `max_parallel_provisioning` at a time
    async fn before_generate_load(&self) -> Result<()> {
        let mut pending: Vec<LoadAgent> = self
            .context()
            .store
            .load_agents(self.id())?
            .into_iter()
            .filter(|a| a.active && !a.has_address())
            .collect();

        if !pending.is_empty() {
            info!(
                clusterable = %self.id(),
                agents = pending.len(),
                "Starting load agents"
            );
            let limit = self.context().settings.parallelism();
            let workflows: Vec<_> = pending
                .iter_mut()
                .map(|agent| self.provision_agent(agent))
                .collect();
            run_bounded(workflows, limit).await?;
        }

        let reachable = self
            .context()
            .store
            .load_agents(self.id())?
            .iter()
            .filter(|a| a.active && a.has_address())
            .count();
        self.context()
            .metrics
            .set_agents_reachable(self.id(), reachable as i64);
        Ok(())
    }

    /// One provisioning workflow; the agent is persisted on both outcomes
    async fn provision_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        let ctx = self.context();
        let started = Instant::now();

        if agent.state != AgentState::Provisioning {
            agent.begin_provisioning()?;
        }

        match self.start_agent(agent).await {
            Ok(()) => {
                ctx.store.save_agent(agent)?;
                let elapsed = started.elapsed();
                ctx.metrics.observe_provisioning(self.id(), elapsed);
                ctx.logger.log_agent_provisioned(
                    self.id(),
                    &agent.id,
                    agent.identifier.as_deref().unwrap_or_default(),
                    agent.ssh_address().unwrap_or_default(),
                    elapsed,
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    clusterable = %self.id(),
                    agent_id = %agent.id,
                    error = %e,
                    "Load agent provisioning failed"
                );
                ctx.metrics
                    .inc_provisioning_failures(self.id(), failure_reason(&e));
                agent.provisioning_failed(true);
                ctx.store.save_agent(agent)?;
                Err(e)
            }
        }
    }

    /// With `suspend`, stop and release every active agent that holds an
    /// address and is not generating
    async fn after_stop_load_generation(&self, options: StopOptions) -> Result<()> {
        if !options.suspend {
            return Ok(());
        }

        let mut stopped: Vec<LoadAgent> = self
            .context()
            .store
            .load_agents(self.id())?
            .into_iter()
            .filter(|a| a.active && a.has_address() && !a.is_running())
            .collect();

        debug!(clusterable = %self.id(), agents = stopped.len(), "Suspending load agents");
        let limit = self.context().settings.parallelism();
        let workflows: Vec<_> = stopped
            .iter_mut()
            .map(|agent| self.suspend_agent(agent))
            .collect();
        run_bounded(workflows, limit).await?;

        self.context().metrics.set_agents_reachable(self.id(), 0);
        Ok(())
    }

    async fn suspend_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        self.stop_agent(agent).await?;
        self.release_agent(agent).await?;
        self.context().store.save_agent(agent)?;
        self.context()
            .logger
            .log_agent_released(self.id(), &agent.id, agent.identifier.is_some());
        Ok(())
    }

    /// Tear one agent down and forget it
    async fn destroy_load_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        if agent.is_running() {
            return Err(FleetError::validation(format!(
                "load agent {} is still generating load",
                agent.id
            )));
        }

        debug!(clusterable = %self.id(), agent_id = %agent.id, "Destroying load agent");
        self.before_destroy_load_agent(agent).await?;
        self.after_destroy_load_agent(agent).await?;
        agent.deactivate()?;
        self.context().store.delete_agent(&agent.id)?;
        self.context()
            .logger
            .log_agent_released(self.id(), &agent.id, false);
        Ok(())
    }

    /// Destroy every agent of this clusterable
    async fn destroy_load_agents(&self) -> Result<()> {
        let agents = self.context().store.load_agents(self.id())?;
        for mut agent in agents {
            self.destroy_load_agent(&mut agent).await?;
        }
        self.context().metrics.set_agents_reachable(self.id(), 0);
        Ok(())
    }
}
