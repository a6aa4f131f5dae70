//! Elastic compute back-end
//!
//! Agents are cloud instances launched from the agent image. An agent whose
//! instance was stopped keeps its instance id and is restarted on the next
//! run instead of being recreated.

use crate::account_cleanup::AccountCleaner;
use crate::clusterable::{Clusterable, FleetContext};
use crate::compute::{ComputeApi, ComputeClientFactory, Credentials, Instance, InstanceState};
use crate::error::{FleetError, Result};
use crate::fixed_pool::{default_ssh_port, default_user_name};
use crate::image::{ImageBuilder, LaunchTemplate};
use crate::lifecycle::LoadAgent;
use crate::models::{ClusterConfig, ClusterableKind, Project, TestPlan};
use crate::session::{ensure_reachable, SshAccess, SshAuth};
use crate::settings::ARTIFACT_PREFIX;
use crate::verifier::Prerequisites;
use crate::wait::wait_until;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Name of the security group agents are launched into
pub const DEFAULT_SECURITY_GROUP: &str = "loadfleet-agent";

/// Relative capacity of an instance size
const SIZE_UNITS: &[(&str, u32)] = &[
    ("nano", 1),
    ("micro", 2),
    ("small", 4),
    ("medium", 8),
    ("large", 16),
    ("xlarge", 32),
    ("2xlarge", 64),
    ("3xlarge", 96),
    ("4xlarge", 128),
    ("6xlarge", 192),
    ("8xlarge", 256),
    ("9xlarge", 288),
    ("10xlarge", 320),
    ("12xlarge", 384),
    ("16xlarge", 512),
    ("18xlarge", 576),
    ("24xlarge", 768),
    ("32xlarge", 1024),
    ("metal", 1024),
];

/// Threads per size unit by instance family (first letter of the class)
const FAMILY_THREADS_PER_UNIT: &[(char, f64)] = &[
    ('t', 3.0),
    ('m', 5.0),
    ('c', 7.5),
    ('r', 5.0),
    ('x', 5.0),
    ('z', 6.0),
    ('d', 4.0),
    ('i', 4.0),
    ('h', 4.0),
];

const MIN_THREADS_PER_AGENT: u32 = 3;
const MAX_THREADS_PER_AGENT: u32 = 10_000;

/// Round to the nearest 5 up to 10, the nearest 10 up to 50 and the
/// nearest 50 beyond; halves round up
pub fn round_off_max_threads_per_agent(threads: u32) -> u32 {
    let unit = if threads <= 10 {
        5
    } else if threads <= 50 {
        10
    } else {
        50
    };
    (((threads + unit / 2) / unit) * unit).max(5)
}

/// Default thread capacity of one agent of `instance_type`
pub fn default_max_threads_per_agent(instance_type: &str) -> u32 {
    let (class, size) = instance_type.split_once('.').unwrap_or((instance_type, "large"));
    let units = SIZE_UNITS
        .iter()
        .find(|(name, _)| *name == size)
        .map(|(_, units)| *units)
        .unwrap_or(16);
    let per_unit = class
        .chars()
        .next()
        .and_then(|family| {
            FAMILY_THREADS_PER_UNIT
                .iter()
                .find(|(f, _)| *f == family)
                .map(|(_, t)| *t)
        })
        .unwrap_or(5.0);

    let raw = (units as f64 * per_unit).round() as u32;
    round_off_max_threads_per_agent(raw.clamp(MIN_THREADS_PER_AGENT, MAX_THREADS_PER_AGENT))
        .min(MAX_THREADS_PER_AGENT)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticComputeConfig {
    pub id: String,
    #[serde(default)]
    pub active: bool,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Key pair name; also names the identity file
    #[serde(default)]
    pub ssh_identity: Option<String>,
    #[serde(default)]
    pub autogenerated_ssh_key: bool,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default)]
    pub max_threads_per_agent: Option<u32>,
    /// Cached agent image id
    #[serde(default)]
    pub agent_ami: Option<String>,
    #[serde(default)]
    pub security_group: Option<String>,
    #[serde(default)]
    pub vpc_subnet_id: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_instance_type() -> String {
    "m5.large".to_string()
}

impl ElasticComputeConfig {
    pub fn new(
        id: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            active: true,
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: default_region(),
            zone: None,
            instance_type: default_instance_type(),
            ssh_identity: None,
            autogenerated_ssh_key: false,
            user_name: default_user_name(),
            max_threads_per_agent: None,
            agent_ami: None,
            security_group: None,
            vpc_subnet_id: None,
            ssh_port: default_ssh_port(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.access_key.clone(), self.secret_key.clone())
    }

    /// Fill in the generated key name, security group and thread capacity
    pub fn apply_defaults(&mut self, app_name: &str) {
        if self.ssh_identity.is_none() {
            self.ssh_identity = Some(format!("{}_{}", ARTIFACT_PREFIX, app_name));
            self.autogenerated_ssh_key = true;
        }
        if self.security_group.is_none() {
            self.security_group = Some(DEFAULT_SECURITY_GROUP.to_string());
        }
        if self.max_threads_per_agent.is_none() {
            self.max_threads_per_agent = Some(default_max_threads_per_agent(&self.instance_type));
        }
    }

    pub fn key_name(&self) -> String {
        self.ssh_identity
            .clone()
            .unwrap_or_else(|| format!("{}_agent", ARTIFACT_PREFIX))
    }

    /// Identity file name; key pair names get a `.pem` extension
    pub fn identity_file_name(&self) -> String {
        let key = self.key_name();
        if key.ends_with(".pem") {
            key
        } else {
            format!("{}.pem", key)
        }
    }

    pub fn threads_per_agent(&self) -> u32 {
        self.max_threads_per_agent
            .unwrap_or_else(|| default_max_threads_per_agent(&self.instance_type))
            .max(1)
    }
}

pub struct ElasticCompute {
    id: String,
    config: RwLock<ElasticComputeConfig>,
    project: Arc<Project>,
    prerequisites: Prerequisites,
    compute: Arc<dyn ComputeClientFactory>,
    ctx: FleetContext,
}

impl ElasticCompute {
    pub fn new(
        mut config: ElasticComputeConfig,
        project: Arc<Project>,
        compute: Arc<dyn ComputeClientFactory>,
        ctx: FleetContext,
    ) -> Self {
        config.apply_defaults(&ctx.settings.app_name);
        Self {
            id: config.id.clone(),
            config: RwLock::new(config),
            prerequisites: Prerequisites::for_project(&project),
            project,
            compute,
            ctx,
        }
    }

    async fn client(&self) -> Arc<dyn ComputeApi> {
        let config = self.config.read().await;
        self.compute.client(&config.credentials(), &config.region)
    }

    async fn identity_path(&self) -> PathBuf {
        let config = self.config.read().await;
        self.ctx
            .settings
            .resolve_identity(&config.identity_file_name())
    }

    async fn save_config(&self) -> Result<()> {
        self.ctx.store.save_cluster(&self.config().await)
    }

    /// Create the key pair and write its private key when auto-generated
    async fn ensure_key_pair(&self, client: &dyn ComputeApi) -> Result<()> {
        let config = self.config.read().await.clone();
        let identity = self.identity_path().await;
        let key_name = config.key_name();

        if !config.autogenerated_ssh_key {
            if !tokio::fs::try_exists(&identity).await? {
                return Err(FleetError::validation(format!(
                    "{}: identity file {} not found",
                    self.id,
                    identity.display()
                )));
            }
            return Ok(());
        }

        if tokio::fs::try_exists(&identity).await? && client.find_key_pair(&key_name).await?.is_some() {
            return Ok(());
        }

        // a key pair without its private key is useless
        if client.find_key_pair(&key_name).await?.is_some() {
            client.delete_key_pair(&key_name).await?;
        }

        info!(clusterable = %self.id, key = %key_name, "Creating key pair");
        let material = client.create_key_pair(&key_name).await?;
        write_private_key(&identity, &material).await?;
        Ok(())
    }

    async fn ensure_security_group(&self, client: &dyn ComputeApi) -> Result<String> {
        let name = self
            .config
            .read()
            .await
            .security_group
            .clone()
            .unwrap_or_else(|| DEFAULT_SECURITY_GROUP.to_string());

        if let Some(group) = client.find_security_group(&name).await? {
            return Ok(group.id);
        }
        info!(clusterable = %self.id, group = %name, "Creating security group");
        client
            .create_security_group(&name, "Load fleet agents, SSH only")
            .await
    }

    async fn launch_template(&self, client: &dyn ComputeApi) -> Result<LaunchTemplate> {
        let group_id = self.ensure_security_group(client).await?;
        let config = self.config.read().await.clone();
        Ok(LaunchTemplate {
            instance_type: config.instance_type.clone(),
            key_name: config.key_name(),
            security_group_ids: vec![group_id],
            subnet_id: config.vpc_subnet_id.clone(),
            availability_zone: config.zone.clone(),
            access: self.ssh_access().await,
        })
    }

    /// Wait for status checks, then for session access, then verify
    async fn await_usable(&self, client: Arc<dyn ComputeApi>, instance_id: &str) -> Result<Instance> {
        let region = client.region().to_string();
        info!(clusterable = %self.id, instance_id = %instance_id, region = %region, "Waiting for system checks");

        let id = instance_id.to_string();
        let poll = client.clone();
        wait_until(
            &format!("{} to start and successful system checks", instance_id),
            &region,
            self.ctx.settings.instance_ready_options(),
            || {
                let poll = poll.clone();
                let id = id.clone();
                async move { poll.instance_ready(&id).await }
            },
        )
        .await?;

        let instance = client.find_instance(instance_id).await?.ok_or_else(|| {
            FleetError::cloud_api("describe-instances", format!("{} vanished", instance_id))
        })?;
        let host = instance
            .public_ip_address
            .clone()
            .or_else(|| instance.private_ip_address.clone())
            .ok_or_else(|| {
                FleetError::cloud_api("describe-instances", format!("{} has no address", instance_id))
            })?;

        let access = self.ssh_access().await;
        ensure_reachable(
            self.ctx.sessions.as_ref(),
            &host,
            &access,
            self.ctx.settings.wait_options(),
        )
        .await?;

        let mut session = self
            .ctx
            .sessions
            .open(&host, &access.user, &access.auth)
            .await?;
        let verified = self
            .ctx
            .verifier
            .verify(session.as_mut(), &self.prerequisites)
            .await;
        session.close().await?;
        verified?;

        Ok(instance)
    }

    async fn wait_for_state(
        &self,
        client: Arc<dyn ComputeApi>,
        instance_id: &str,
        target: InstanceState,
    ) -> Result<()> {
        let id = instance_id.to_string();
        let region = client.region().to_string();
        wait_until(
            &format!("{} to be {}", instance_id, target),
            &region,
            self.ctx.settings.instance_ready_options(),
            || {
                let client = client.clone();
                let id = id.clone();
                async move {
                    Ok(match client.find_instance(&id).await? {
                        Some(instance) => instance.state == target,
                        // terminated instances eventually disappear
                        None => target == InstanceState::Terminated,
                    })
                }
            },
        )
        .await
        .map(|_| ())
    }
}

/// Write a private key readable by the owner only
pub async fn write_private_key(path: &std::path::Path, material: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, material).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[async_trait]
impl Clusterable for ElasticCompute {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ClusterableKind {
        ClusterableKind::ElasticCompute
    }

    fn context(&self) -> &FleetContext {
        &self.ctx
    }

    async fn slug(&self) -> String {
        format!("Elastic compute, region: {}", self.config.read().await.region)
    }

    async fn is_active(&self) -> bool {
        self.config.read().await.active
    }

    async fn config(&self) -> ClusterConfig {
        ClusterConfig::ElasticCompute(self.config.read().await.clone())
    }

    async fn ssh_access(&self) -> SshAccess {
        let (user, port) = {
            let config = self.config.read().await;
            (config.user_name.clone(), config.ssh_port)
        };
        SshAccess {
            user,
            auth: SshAuth::new(self.identity_path().await)
                .port(port)
                .connect_timeout(self.ctx.settings.ssh_connect_timeout()),
        }
    }

    async fn validate(&self) -> Result<()> {
        let config = self.config.read().await.clone();
        if !config.active {
            return Ok(());
        }

        for (field, value) in [
            ("access key", &config.access_key),
            ("secret key", &config.secret_key),
            ("region", &config.region),
            ("instance type", &config.instance_type),
        ] {
            if value.trim().is_empty() {
                return Err(FleetError::validation(format!(
                    "{}: {} is required",
                    config.id, field
                )));
            }
        }
        if config.max_threads_per_agent == Some(0) {
            return Err(FleetError::validation(format!(
                "{}: max threads per agent must be positive",
                config.id
            )));
        }
        Ok(())
    }

    /// Key pair, security group and agent image
    async fn prepare(&self) -> Result<()> {
        let client = self.client().await;
        self.ensure_key_pair(client.as_ref()).await?;
        let template = self.launch_template(client.as_ref()).await?;

        if self.config.read().await.agent_ami.is_none() {
            let image_id = ImageBuilder::new(client.clone(), &self.ctx)
                .ensure(&self.project, &self.prerequisites, &template)
                .await?;
            self.config.write().await.agent_ami = Some(image_id);
            self.save_config().await?;
        }
        Ok(())
    }

    /// 1 for a single thread group, otherwise enough agents for all threads
    async fn required_load_agent_count(&self, plan: &TestPlan) -> usize {
        if plan.thread_group_count() <= 1 {
            return 1;
        }
        let per_agent = self.config.read().await.threads_per_agent();
        (plan.num_threads().div_ceil(per_agent) as usize).max(1)
    }

    async fn start_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        let client = self.client().await;

        let existing = match agent.identifier.as_deref() {
            Some(id) => client.find_instance(id).await?,
            None => None,
        };

        let instance_id = match existing {
            Some(instance) if !instance.state.is_terminal() => {
                if matches!(instance.state, InstanceState::Stopped | InstanceState::Stopping) {
                    if instance.state == InstanceState::Stopping {
                        self.wait_for_state(client.clone(), &instance.id, InstanceState::Stopped)
                            .await?;
                    }
                    info!(clusterable = %self.id, instance_id = %instance.id, "Restarting stopped instance");
                    client.start_instance(&instance.id).await?;
                }
                instance.id
            }
            _ => {
                let image = self.config.read().await.agent_ami.clone().ok_or_else(|| {
                    FleetError::validation(format!("{}: agent image not prepared", self.id))
                })?;
                let template = self.launch_template(client.as_ref()).await?;
                let tag = format!("{}-{}", ARTIFACT_PREFIX, self.project.code);
                let instance = client
                    .create_instance(&template.instance_spec(&image, &tag))
                    .await?;
                info!(clusterable = %self.id, agent_id = %agent.id, instance_id = %instance.id, "Launched instance");
                instance.id
            }
        };

        // retained on failure so cleanup can find the instance
        agent.identifier = Some(instance_id.clone());

        let instance = self.await_usable(client, &instance_id).await?;
        let private = instance
            .private_ip_address
            .clone()
            .or_else(|| instance.public_ip_address.clone())
            .unwrap_or_default();
        agent.mark_reachable(instance.id, instance.public_ip_address, private)?;
        Ok(())
    }

    async fn stop_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        let instance_id = match agent.identifier.clone() {
            Some(id) => id,
            None => {
                warn!(clusterable = %self.id, agent_id = %agent.id, "Agent has no instance to stop");
                return Ok(());
            }
        };

        let client = self.client().await;
        match client.find_instance(&instance_id).await? {
            Some(instance) if instance.state == InstanceState::Running => {
                info!(clusterable = %self.id, instance_id = %instance_id, "Stopping instance");
                client.stop_instance(&instance_id).await?;
                self.wait_for_state(client, &instance_id, InstanceState::Stopped)
                    .await
            }
            Some(instance) => {
                debug!(instance_id = %instance_id, state = %instance.state, "Instance not running");
                Ok(())
            }
            None => {
                warn!(clusterable = %self.id, instance_id = %instance_id, "Instance not found");
                Ok(())
            }
        }
    }

    async fn before_destroy_load_agent(&self, agent: &mut LoadAgent) -> Result<()> {
        let instance_id = match agent.identifier.clone() {
            Some(id) => id,
            None => return Ok(()),
        };

        let client = self.client().await;
        match client.find_instance(&instance_id).await? {
            Some(instance) if !instance.state.is_terminal() => {
                info!(clusterable = %self.id, instance_id = %instance_id, "Terminating instance");
                client.terminate_instance(&instance_id).await?;
                self.wait_for_state(client, &instance_id, InstanceState::Terminated)
                    .await
            }
            _ => {
                warn!(clusterable = %self.id, instance_id = %instance_id, "Instance already gone");
                Ok(())
            }
        }
    }

    /// Delete the generated key pair and identity file once the clusterable
    /// is inactive and no agents remain
    async fn cleanup(&self) -> Result<()> {
        let config = self.config.read().await.clone();
        if config.active || !config.autogenerated_ssh_key {
            debug!(clusterable = %self.id, "Nothing to clean up");
            return Ok(());
        }
        if !self.ctx.store.load_agents(&self.id)?.is_empty() {
            debug!(clusterable = %self.id, "Load agents remain, keeping key pair");
            return Ok(());
        }

        let client = self.client().await;
        let key_name = config.key_name();
        if client.find_key_pair(&key_name).await?.is_some() {
            client.delete_key_pair(&key_name).await?;
        }

        let identity = self.identity_path().await;
        if tokio::fs::try_exists(&identity).await? {
            tokio::fs::remove_file(&identity).await?;
        }
        info!(clusterable = %self.id, key = %key_name, "Removed generated key pair");
        Ok(())
    }

    /// Clean the region and forget the cached agent image
    async fn purge(&self) -> Result<()> {
        let client = self.client().await;
        let report = AccountCleaner::new(&self.ctx).clean_region(client.as_ref()).await?;
        debug!(clusterable = %self.id, images = report.images_deregistered, "Region purged");
        self.forget_artifacts().await
    }

    /// The agent image is rebuilt by the next setup
    async fn forget_artifacts(&self) -> Result<()> {
        self.config.write().await.agent_ami = None;
        self.save_config().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusterable::StopOptions;
    use crate::lifecycle::AgentState;
    use crate::models::ThreadGroup;
    use crate::test_support::{context, MockComputeFactory, ScriptedSessionFactory};
    use crate::store::{FleetStore, InMemoryStore};
    use tempfile::TempDir;

    const SIZES: &[&str] = &[
        "nano", "micro", "small", "medium", "large", "xlarge", "2xlarge", "4xlarge", "10xlarge",
        "16xlarge", "32xlarge",
    ];

    #[test]
    fn test_default_threads_increase_with_size() {
        let mut all = Vec::new();
        for class in ["t2", "t3", "m4", "m5", "c4", "c5", "r4", "r5", "d2", "i3", "x1"] {
            let per_class: Vec<u32> = SIZES
                .iter()
                .map(|size| default_max_threads_per_agent(&format!("{}.{}", class, size)))
                .collect();
            let mut sorted = per_class.clone();
            sorted.sort();
            assert_eq!(per_class, sorted, "{} not monotonic", class);
            all.extend(per_class);
        }
        assert!(all.iter().all(|t| *t >= 3 && *t <= 10_000));
    }

    #[test]
    fn test_round_off_max_threads_per_agent() {
        for (input, expected) in [
            (4, 5),
            (5, 5),
            (8, 10),
            (11, 10),
            (15, 20),
            (44, 40),
            (45, 50),
            (51, 50),
            (75, 100),
            (155, 150),
            (375, 400),
        ] {
            assert_eq!(round_off_max_threads_per_agent(input), expected, "{}", input);
        }
    }

    #[test]
    fn test_apply_defaults_generates_identity() {
        let mut config = ElasticComputeConfig::new("ec2-1", "AKIA", "secret");
        config.apply_defaults("acme_app");
        assert_eq!(config.ssh_identity.as_deref(), Some("loadfleet_acme_app"));
        assert!(config.autogenerated_ssh_key);
        assert_eq!(config.identity_file_name(), "loadfleet_acme_app.pem");
        assert_eq!(config.security_group.as_deref(), Some(DEFAULT_SECURITY_GROUP));
        assert!(config.max_threads_per_agent.is_some());

        let mut supplied = ElasticComputeConfig::new("ec2-2", "AKIA", "secret");
        supplied.ssh_identity = Some("team.pem".to_string());
        supplied.apply_defaults("acme_app");
        assert!(!supplied.autogenerated_ssh_key);
        assert_eq!(supplied.identity_file_name(), "team.pem");
    }

    struct Fixture {
        dir: TempDir,
        sessions: Arc<ScriptedSessionFactory>,
        store: Arc<InMemoryStore>,
        compute: Arc<MockComputeFactory>,
        elastic: ElasticCompute,
    }

    fn fixture(configure: impl FnOnce(&mut ElasticComputeConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(ScriptedSessionFactory::healthy());
        let (ctx, store) = context(sessions.clone(), dir.path());
        let compute = Arc::new(MockComputeFactory::new());
        compute
            .region("us-east-1")
            .put_image("ami-agent", "loadfleet-j5.4.1-x86_64");

        let mut config = ElasticComputeConfig::new("ec2-1", "AKIA", "secret");
        configure(&mut config);
        let elastic = ElasticCompute::new(
            config,
            Arc::new(Project::new("acme")),
            compute.clone(),
            ctx,
        );
        Fixture {
            dir,
            sessions,
            store,
            compute,
            elastic,
        }
    }

    fn plan(groups: &[u32]) -> TestPlan {
        TestPlan::new(
            "shop",
            groups
                .iter()
                .enumerate()
                .map(|(i, n)| ThreadGroup {
                    name: format!("g{}", i),
                    num_threads: *n,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_required_count() {
        let f = fixture(|c| c.max_threads_per_agent = Some(50));
        assert_eq!(f.elastic.required_load_agent_count(&plan(&[500])).await, 1);
        assert_eq!(f.elastic.required_load_agent_count(&plan(&[60, 60])).await, 3);
        assert_eq!(f.elastic.required_load_agent_count(&plan(&[25, 25])).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_generates_key_and_provisions() {
        let f = fixture(|c| c.max_threads_per_agent = Some(50));
        f.elastic.setup(&[plan(&[40, 40])], false).await.unwrap();

        let region = f.compute.region("us-east-1");
        assert_eq!(region.key_pairs(), vec!["loadfleet_acme_app".to_string()]);
        let identity = f.dir.path().join("loadfleet_acme_app.pem");
        assert!(identity.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&identity).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let agents = f.store.load_agents("ec2-1").unwrap();
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().all(|a| a.state == AgentState::Reachable));
        assert!(region.launched().iter().all(|s| s.image_id == "ami-agent"));

        match f.store.load_cluster("ec2-1").unwrap().unwrap() {
            ClusterConfig::ElasticCompute(c) => assert_eq!(c.agent_ami.as_deref(), Some("ami-agent")),
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_instance_becomes_reachable() {
        let f = fixture(|c| c.agent_ami = Some("ami-agent".to_string()));
        let region = f.compute.region("us-east-1");
        region.ready_after(3);

        let mut agent = LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop");
        f.elastic.provision_agent(&mut agent).await.unwrap();

        assert_eq!(region.count("describe-instance-status"), 3);
        assert_eq!(agent.state, AgentState::Reachable);
        assert_eq!(agent.identifier.as_deref(), Some("i-0001"));
        assert!(agent.public_ip_address.is_some());
        assert!(agent.private_ip_address.is_some());
        assert_eq!(region.instance("i-0001").unwrap().state, InstanceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_is_operation_timeout() {
        let f = fixture(|c| c.agent_ami = Some("ami-agent".to_string()));
        f.compute.region("us-east-1").ready_after(u32::MAX);

        let mut agent = LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop");
        let started = tokio::time::Instant::now();
        let err = f.elastic.provision_agent(&mut agent).await.unwrap_err();

        assert!(started.elapsed() >= std::time::Duration::from_secs(600));
        match err {
            FleetError::OperationTimeout { scope, .. } => assert_eq!(scope, "us-east-1"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(agent.state, AgentState::Unprovisioned);
        assert!(agent.identifier.is_some());
        assert!(!agent.has_address());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_instance_times_out_with_cause() {
        let f = fixture(|c| c.agent_ami = Some("ami-agent".to_string()));
        f.sessions.unreachable("54.0.0.1", usize::MAX);

        let mut agent = LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop");
        let err = f.elastic.provision_agent(&mut agent).await.unwrap_err();

        match err {
            FleetError::OperationTimeout { last_error, .. } => {
                assert!(last_error.unwrap().contains("Connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_tool_version_never_reachable() {
        let f = fixture(|c| c.agent_ami = Some("ami-agent".to_string()));
        f.sessions.respond_on(
            "54.0.0.1",
            "$HOME/apache-jmeter-5.4.1/bin/jmeter",
            "5.3\nThe Apache Software Foundation",
            0,
        );

        let mut agent = LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop");
        let err = f.elastic.provision_agent(&mut agent).await.unwrap_err();
        assert!(matches!(err, FleetError::ToolVersionFailure { .. }));
        assert_eq!(agent.state, AgentState::Unprovisioned);
        assert_eq!(
            f.sessions.opened.load(std::sync::atomic::Ordering::SeqCst),
            f.sessions.released.load(std::sync::atomic::Ordering::SeqCst)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_stops_and_restart_reuses_instance() {
        let f = fixture(|c| c.agent_ami = Some("ami-agent".to_string()));
        let region = f.compute.region("us-east-1");

        let mut agent = LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop");
        f.store.save_agent(&agent).unwrap();
        f.elastic.before_generate_load().await.unwrap();

        f.elastic
            .after_stop_load_generation(StopOptions {
                suspend: true,
                aborted: false,
            })
            .await
            .unwrap();

        agent = f.store.load_agents("ec2-1").unwrap().remove(0);
        assert_eq!(agent.state, AgentState::Released);
        assert_eq!(agent.identifier.as_deref(), Some("i-0001"));
        assert_eq!(region.instance("i-0001").unwrap().state, InstanceState::Stopped);

        f.elastic.before_generate_load().await.unwrap();
        let agent = f.store.load_agents("ec2-1").unwrap().remove(0);
        assert_eq!(agent.state, AgentState::Reachable);
        assert_eq!(agent.identifier.as_deref(), Some("i-0001"));
        assert_eq!(region.count("run-instances"), 1);
        assert_eq!(region.count("start-instances"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_terminates_instance() {
        let f = fixture(|c| c.agent_ami = Some("ami-agent".to_string()));
        f.store
            .save_agent(&LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop"))
            .unwrap();
        f.elastic.before_generate_load().await.unwrap();

        f.elastic.destroy_load_agents().await.unwrap();
        assert!(f.store.load_agents("ec2-1").unwrap().is_empty());
        assert_eq!(
            f.compute.region("us-east-1").instance("i-0001").unwrap().state,
            InstanceState::Terminated
        );
    }

    #[tokio::test]
    async fn test_cleanup_deletes_generated_key_only_without_agents() {
        let f = fixture(|c| c.active = false);
        let region = f.compute.region("us-east-1");
        region.put_key_pair("loadfleet_acme_app");
        let identity = f.dir.path().join("loadfleet_acme_app.pem");
        std::fs::write(&identity, "key").unwrap();

        f.store
            .save_agent(&LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop"))
            .unwrap();
        f.elastic.cleanup().await.unwrap();
        assert_eq!(region.key_pairs().len(), 1);
        assert!(identity.exists());

        f.store.delete_agent("ec2-1-shop-1").unwrap();
        f.elastic.cleanup().await.unwrap();
        assert!(region.key_pairs().is_empty());
        assert!(!identity.exists());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_key_while_active() {
        let f = fixture(|_| {});
        let region = f.compute.region("us-east-1");
        region.put_key_pair("loadfleet_acme_app");

        f.elastic.cleanup().await.unwrap();
        assert_eq!(region.key_pairs().len(), 1);
    }

    #[tokio::test]
    async fn test_cloud_api_failure_propagates_unchanged() {
        let f = fixture(|c| c.agent_ami = Some("ami-agent".to_string()));
        f.compute.region("us-east-1").fail_on("run-instances");

        let mut agent = LoadAgent::new("ec2-1-shop-1", "ec2-1", "shop");
        let err = f.elastic.provision_agent(&mut agent).await.unwrap_err();
        match err {
            FleetError::CloudApiFailure { operation, message } => {
                assert_eq!(operation, "run-instances");
                assert_eq!(message, "injected failure");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validation_requires_credentials() {
        let f = fixture(|c| c.secret_key = String::new());
        assert!(matches!(
            f.elastic.validate().await,
            Err(FleetError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_slug() {
        let f = fixture(|c| c.region = "eu-west-1".to_string());
        assert_eq!(f.elastic.slug().await, "Elastic compute, region: eu-west-1");
    }
}
