//! Settings, project loading and runtime wiring for the CLI

use anyhow::{Context, Result};
use fleet_lib::aws_cli::AwsCliFactory;
use fleet_lib::launcher::SshLoadGenerator;
use fleet_lib::session::{OpenSshSessionFactory, SessionFactory};
use fleet_lib::store::JsonFileStore;
use fleet_lib::verifier::PrerequisiteVerifier;
use fleet_lib::{FleetContext, FleetOrchestrator, FleetSettings, Project};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const SETTINGS_FILE: &str = "fleet.toml";

/// Settings file used when none is given on the command line
fn default_settings_path() -> Option<PathBuf> {
    let local = PathBuf::from(SETTINGS_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs_next::config_dir()
        .map(|dir| dir.join("fleet").join(SETTINGS_FILE))
        .filter(|path| path.exists())
}

/// Load settings from an optional file, overridden by `FLEET_*` variables
pub fn load_settings(path: Option<&Path>) -> Result<FleetSettings> {
    let mut builder = config::Config::builder();

    match path {
        Some(path) => {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        None => {
            if let Some(path) = default_settings_path() {
                debug!(path = %path.display(), "Using settings file");
                builder = builder.add_source(config::File::from(path).required(false));
            }
        }
    }

    let settings = builder
        .add_source(config::Environment::with_prefix("FLEET").try_parsing(true))
        .build()
        .context("Failed to read settings")?;

    settings
        .try_deserialize()
        .context("Failed to parse settings")
}

/// Load the project file
pub fn load_project(path: &Path) -> Result<Project> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read project file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse project file {}", path.display()))
}

/// Everything a command needs
pub struct FleetRuntime {
    pub settings: FleetSettings,
    pub orchestrator: FleetOrchestrator,
    pub generator: SshLoadGenerator,
}

impl FleetRuntime {
    pub fn build(settings: FleetSettings, project: Project) -> Result<Self> {
        let state_path = settings.state_path();
        let store = Arc::new(
            JsonFileStore::open(&state_path)
                .with_context(|| format!("Failed to open state file {}", state_path.display()))?,
        );
        let sessions: Arc<dyn SessionFactory> = Arc::new(OpenSshSessionFactory::new());
        let generator = SshLoadGenerator::new(
            sessions.clone(),
            project.tool.clone(),
            settings.app_name.clone(),
            settings.wait_options(),
        );

        info!(project = %project.code, clusterables = project.clusters.len(), "Loaded project");
        let ctx = FleetContext::new(
            settings.clone(),
            store,
            sessions,
            Arc::new(PrerequisiteVerifier::new()),
            &project.code,
        );
        let orchestrator = FleetOrchestrator::new(project, ctx, Arc::new(AwsCliFactory::new()))
            .context("Failed to build clusterables")?;

        Ok(Self {
            settings,
            orchestrator,
            generator,
        })
    }
}
