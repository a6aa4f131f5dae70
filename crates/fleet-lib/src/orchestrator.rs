//! Fleet orchestration across the clusterables of a project

use crate::account_cleanup::{purge_accounts, PurgeReport};
use crate::clusterable::{run_bounded, Clusterable, FleetContext, StopOptions};
use crate::compute::ComputeClientFactory;
use crate::elastic::ElasticCompute;
use crate::error::{FleetError, Result};
use crate::fixed_pool::FixedPool;
use crate::launcher::LoadGenerator;
use crate::lifecycle::LoadAgent;
use crate::models::{ClusterConfig, ClusterableKind, ExecutionCycle, Project};
use crate::session::SshAccess;
use crate::verifier::Prerequisites;
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot of one clusterable and its agents
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub id: String,
    pub kind: ClusterableKind,
    pub slug: String,
    pub active: bool,
    pub agents: Vec<LoadAgent>,
}

impl ClusterStatus {
    pub fn reachable(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.active && a.has_address())
            .count()
    }

    pub fn generating(&self) -> usize {
        self.agents.iter().filter(|a| a.is_running()).count()
    }
}

/// Stored settings win over the project file for what the fleet caches
fn merge_stored(config: ClusterConfig, stored: Option<ClusterConfig>) -> ClusterConfig {
    match (config, stored) {
        (ClusterConfig::ElasticCompute(mut config), Some(ClusterConfig::ElasticCompute(stored))) => {
            if config.agent_ami.is_none() {
                config.agent_ami = stored.agent_ami;
            }
            ClusterConfig::ElasticCompute(config)
        }
        (config, _) => config,
    }
}

/// Build the clusterable of every configuration in `project`
pub fn build_clusterables(
    project: &Arc<Project>,
    ctx: &FleetContext,
    compute: &Arc<dyn ComputeClientFactory>,
) -> Result<Vec<Arc<dyn Clusterable>>> {
    let prerequisites = Prerequisites::for_project(project);
    let mut clusterables: Vec<Arc<dyn Clusterable>> = Vec::with_capacity(project.clusters.len());

    for config in &project.clusters {
        let stored = ctx.store.load_cluster(config.id())?;
        let clusterable: Arc<dyn Clusterable> = match merge_stored(config.clone(), stored) {
            ClusterConfig::ElasticCompute(elastic) => Arc::new(ElasticCompute::new(
                elastic,
                project.clone(),
                compute.clone(),
                ctx.clone(),
            )),
            ClusterConfig::FixedPool(pool) => {
                Arc::new(FixedPool::new(pool, prerequisites.clone(), ctx.clone())?)
            }
        };
        clusterables.push(clusterable);
    }
    Ok(clusterables)
}

pub struct FleetOrchestrator {
    project: Arc<Project>,
    clusterables: Vec<Arc<dyn Clusterable>>,
    ctx: FleetContext,
    compute: Arc<dyn ComputeClientFactory>,
}

impl FleetOrchestrator {
    pub fn new(
        project: Project,
        ctx: FleetContext,
        compute: Arc<dyn ComputeClientFactory>,
    ) -> Result<Self> {
        let project = Arc::new(project);
        let clusterables = build_clusterables(&project, &ctx, &compute)?;
        Ok(Self::with_clusterables(project, clusterables, ctx, compute))
    }

    pub fn with_clusterables(
        project: Arc<Project>,
        clusterables: Vec<Arc<dyn Clusterable>>,
        ctx: FleetContext,
        compute: Arc<dyn ComputeClientFactory>,
    ) -> Self {
        Self {
            project,
            clusterables,
            ctx,
            compute,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn clusterables(&self) -> &[Arc<dyn Clusterable>] {
        &self.clusterables
    }

    async fn active_clusterables(&self) -> Vec<Arc<dyn Clusterable>> {
        let mut active = Vec::new();
        for clusterable in &self.clusterables {
            if clusterable.is_active().await {
                active.push(clusterable.clone());
            }
        }
        active
    }

    /// Run `op` on each clusterable concurrently. Every clusterable runs to
    /// completion; the first failure is returned afterwards.
    async fn for_each<F, Fut>(&self, clusterables: Vec<Arc<dyn Clusterable>>, op: F) -> Result<()>
    where
        F: Fn(Arc<dyn Clusterable>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let ids: Vec<String> = clusterables.iter().map(|c| c.id().to_string()).collect();
        let results = join_all(clusterables.into_iter().map(op)).await;

        let mut first_error = None;
        for (id, result) in ids.into_iter().zip(results) {
            if let Err(e) = result {
                if let FleetError::OperationTimeout {
                    description,
                    scope,
                    elapsed,
                    ..
                } = &e
                {
                    self.ctx.logger.log_wait_timeout(description, scope, *elapsed);
                }
                warn!(clusterable = %id, error = %e, "Clusterable operation failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Total agents the active clusterables need for the project's plans
    pub async fn required_load_agent_count(&self) -> usize {
        let mut total = 0;
        for clusterable in self.active_clusterables().await {
            for plan in &self.project.test_plans {
                total += clusterable.required_load_agent_count(plan).await;
            }
        }
        total
    }

    /// Set up every clusterable; inactive ones only when forced
    pub async fn setup(&self, force: bool) -> Result<()> {
        info!(project = %self.project.code, force = force, "Setting up fleet");
        let plans = &self.project.test_plans;
        self.for_each(self.clusterables.clone(), |c| async move {
            c.setup(plans, force).await
        })
        .await
    }

    /// Bring every agent of the active clusterables to `Reachable`
    pub async fn before_generate_load(&self) -> Result<()> {
        self.for_each(self.active_clusterables().await, |c| async move {
            c.before_generate_load().await
        })
        .await
    }

    pub async fn after_stop_load_generation(&self, options: StopOptions) -> Result<()> {
        self.for_each(self.active_clusterables().await, |c| async move {
            c.after_stop_load_generation(options).await
        })
        .await
    }

    /// Active agents ready to generate, paired with their session access
    async fn idle_agents(&self) -> Result<Vec<(SshAccess, LoadAgent)>> {
        let mut agents = Vec::new();
        for clusterable in self.active_clusterables().await {
            let access = clusterable.ssh_access().await;
            for agent in self.ctx.store.load_agents(clusterable.id())? {
                if agent.active && agent.has_address() && !agent.is_running() {
                    agents.push((access.clone(), agent));
                }
            }
        }
        Ok(agents)
    }

    async fn running_agents(&self) -> Result<Vec<(SshAccess, LoadAgent)>> {
        let mut agents = Vec::new();
        for clusterable in &self.clusterables {
            let access = clusterable.ssh_access().await;
            for agent in self.ctx.store.load_agents(clusterable.id())? {
                if agent.is_running() {
                    agents.push((access.clone(), agent));
                }
            }
        }
        Ok(agents)
    }

    pub fn current_cycle(&self) -> Result<Option<ExecutionCycle>> {
        self.ctx.store.current_cycle()
    }

    /// Start load generation on every reachable agent and open a cycle
    pub async fn start(&self, generator: &dyn LoadGenerator) -> Result<ExecutionCycle> {
        if let Some(cycle) = self.current_cycle()? {
            return Err(FleetError::validation(format!(
                "execution cycle {} is already running",
                cycle.id
            )));
        }

        self.before_generate_load().await?;

        let id = self.ctx.store.load_cycles()?.len() as u64 + 1;
        let mut cycle = ExecutionCycle::start(id, self.project.code.clone(), self.project.total_threads());
        self.ctx.store.save_cycle(&cycle)?;
        self.ctx
            .logger
            .log_execution_cycle(cycle.id, &cycle.status.to_string(), cycle.threads_count);

        let mut agents = self.idle_agents().await?;
        let store = self.ctx.store.clone();
        let launches: Vec<_> = agents
            .iter_mut()
            .map(|(access, agent)| {
                let store = store.clone();
                async move {
                    let pid = generator.launch(agent, access).await?;
                    agent.start_generating(pid)?;
                    store.save_agent(agent)
                }
            })
            .collect();
        let launched = run_bounded(launches, self.ctx.settings.parallelism()).await;

        if let Err(e) = launched {
            warn!(cycle_id = cycle.id, error = %e, "Load generation failed to start");
            if let Err(halt) = self.halt_running_agents(generator).await {
                warn!(cycle_id = cycle.id, error = %halt, "Failed to halt launched agents");
            }
            cycle.fail();
            self.ctx.store.save_cycle(&cycle)?;
            self.ctx
                .logger
                .log_execution_cycle(cycle.id, &cycle.status.to_string(), cycle.threads_count);
            return Err(e);
        }

        info!(cycle_id = cycle.id, agents = agents.len(), "Load generation started");
        Ok(cycle)
    }

    /// Terminate the load process of every running agent and return the
    /// agent to `Idle`
    async fn halt_running_agents(&self, generator: &dyn LoadGenerator) -> Result<()> {
        let mut agents = self.running_agents().await?;
        if agents.is_empty() {
            return Ok(());
        }

        debug!(agents = agents.len(), "Halting load generation");
        let store = self.ctx.store.clone();
        let halts: Vec<_> = agents
            .iter_mut()
            .map(|(access, agent)| {
                let store = store.clone();
                async move {
                    if let Some(pid) = agent.process_id {
                        generator.terminate(agent, pid, access).await?;
                    }
                    agent.finish_generating()?;
                    store.save_agent(agent)
                }
            })
            .collect();
        run_bounded(halts, self.ctx.settings.parallelism()).await
    }

    /// Stop every running agent, release machines when suspending, and
    /// close the current cycle
    pub async fn stop(&self, generator: &dyn LoadGenerator, options: StopOptions) -> Result<ExecutionCycle> {
        let mut cycle = self
            .current_cycle()?
            .ok_or_else(|| FleetError::validation("no execution cycle is running"))?;

        debug!(cycle_id = cycle.id, "Stopping load generation");
        self.halt_running_agents(generator).await?;

        self.after_stop_load_generation(options).await?;

        if options.aborted {
            cycle.abort();
        } else {
            cycle.stop();
        }
        self.ctx.store.save_cycle(&cycle)?;
        self.ctx
            .logger
            .log_execution_cycle(cycle.id, &cycle.status.to_string(), cycle.threads_count);
        Ok(cycle)
    }

    pub async fn abort(&self, generator: &dyn LoadGenerator) -> Result<ExecutionCycle> {
        self.stop(
            generator,
            StopOptions {
                suspend: false,
                aborted: true,
            },
        )
        .await
    }

    /// Abort any running cycle, destroy every agent and clean up
    pub async fn terminate(&self, generator: &dyn LoadGenerator) -> Result<()> {
        if self.current_cycle()?.is_some() {
            self.abort(generator).await?;
        } else {
            self.halt_running_agents(generator).await?;
        }

        info!(project = %self.project.code, "Terminating fleet");
        self.for_each(self.clusterables.clone(), |c| async move {
            c.destroy_load_agents().await?;
            c.cleanup().await
        })
        .await
    }

    /// Destroy agents, purge every account the project uses and forget
    /// cached artifacts
    pub async fn purge(&self) -> Result<Vec<PurgeReport>> {
        if let Some(cycle) = self.current_cycle()? {
            return Err(FleetError::validation(format!(
                "execution cycle {} is still running",
                cycle.id
            )));
        }

        self.for_each(self.clusterables.clone(), |c| async move {
            c.destroy_load_agents().await
        })
        .await?;

        let mut configs = Vec::with_capacity(self.clusterables.len());
        for clusterable in &self.clusterables {
            configs.push(clusterable.config().await);
        }
        let reports = purge_accounts(&self.ctx, &self.compute, &configs).await?;

        for clusterable in &self.clusterables {
            clusterable.forget_artifacts().await?;
        }
        Ok(reports)
    }

    pub async fn status(&self) -> Result<Vec<ClusterStatus>> {
        let mut statuses = Vec::with_capacity(self.clusterables.len());
        for clusterable in &self.clusterables {
            statuses.push(ClusterStatus {
                id: clusterable.id().to_string(),
                kind: clusterable.kind(),
                slug: clusterable.slug().await,
                active: clusterable.is_active().await,
                agents: self.ctx.store.load_agents(clusterable.id())?,
            });
        }
        Ok(statuses)
    }

    /// Open a session to `host` and verify the project's prerequisites
    pub async fn check_machine(&self, host: &str, access: &SshAccess) -> Result<()> {
        let prerequisites = Prerequisites::for_project(&self.project);
        let mut session = self
            .ctx
            .sessions
            .open(host, &access.user, &access.auth)
            .await?;
        let verified = self
            .ctx
            .verifier
            .verify(session.as_mut(), &prerequisites)
            .await;
        session.close().await?;
        verified
    }
}
