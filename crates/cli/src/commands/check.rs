//! Machine prerequisite check

use anyhow::{Context, Result};
use fleet_lib::session::{SshAccess, SshAuth};
use std::path::Path;

use crate::config::FleetRuntime;
use crate::output::{print_info, print_success};

pub async fn check_machine(
    runtime: &FleetRuntime,
    host: &str,
    user: &str,
    identity: &Path,
    port: u16,
) -> Result<()> {
    let identity_file = runtime
        .settings
        .resolve_identity(&identity.to_string_lossy());
    let access = SshAccess {
        user: user.to_string(),
        auth: SshAuth::new(identity_file)
            .port(port)
            .connect_timeout(runtime.settings.ssh_connect_timeout()),
    };

    let project = runtime.orchestrator.project();
    print_info(&format!(
        "Checking {}@{} for runtime {} and tool {}",
        user, host, project.runtime_version, project.tool.version
    ));
    runtime
        .orchestrator
        .check_machine(host, &access)
        .await
        .with_context(|| format!("{} is not usable as a load agent", host))?;
    print_success(&format!("{} is ready", host));
    Ok(())
}
