//! Load generation processes on agents

use crate::error::{FleetError, Result};
use crate::lifecycle::LoadAgent;
use crate::models::ToolSpec;
use crate::session::{SessionFactory, SshAccess};
use crate::wait::{wait_until, WaitOptions};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Starts and stops the load generation process of one agent
#[async_trait]
pub trait LoadGenerator: Send + Sync {
    /// Launch the tool against the agent's test plan; returns the process id
    async fn launch(&self, agent: &LoadAgent, access: &SshAccess) -> Result<u32>;

    /// Stop `process_id` and wait for it to exit
    async fn terminate(&self, agent: &LoadAgent, process_id: u32, access: &SshAccess) -> Result<()>;
}

/// Runs the tool in non-GUI mode over a remote session
pub struct SshLoadGenerator {
    sessions: Arc<dyn SessionFactory>,
    tool: ToolSpec,
    app_name: String,
    wait: WaitOptions,
}

impl SshLoadGenerator {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        tool: ToolSpec,
        app_name: impl Into<String>,
        wait: WaitOptions,
    ) -> Self {
        Self {
            sessions,
            tool,
            app_name: app_name.into(),
            wait,
        }
    }

    pub fn launch_command(&self, agent: &LoadAgent) -> String {
        format!(
            "mkdir -p ~/{app}/log && cd ~/{app} && nohup {home}/bin/jmeter -n -t {plan}.jmx -l log/{agent}.jtl > log/{agent}.out 2>&1 & echo $!",
            app = self.app_name,
            home = self.tool.home_dir(),
            plan = agent.test_plan,
            agent = agent.id,
        )
    }

    fn host(agent: &LoadAgent) -> Result<&str> {
        agent.ssh_address().ok_or_else(|| {
            FleetError::validation(format!("load agent {} has no address", agent.id))
        })
    }
}

/// The process id echoed by the launch command
fn parse_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .rev()
        .find_map(|line| line.trim().parse::<u32>().ok())
}

#[async_trait]
impl LoadGenerator for SshLoadGenerator {
    async fn launch(&self, agent: &LoadAgent, access: &SshAccess) -> Result<u32> {
        let host = Self::host(agent)?;
        let command = self.launch_command(agent);

        let mut session = self.sessions.open(host, &access.user, &access.auth).await?;
        let result = session.exec_checked(&command).await;
        session.close().await?;
        let output = result?;

        let pid = parse_pid(&output.output).ok_or_else(|| FleetError::RemoteCommandFailure {
            host: host.to_string(),
            command,
            status: output.exit_status,
            output: output.output.clone(),
        })?;
        info!(agent_id = %agent.id, host = %host, pid = pid, "Load generation started");
        Ok(pid)
    }

    async fn terminate(&self, agent: &LoadAgent, process_id: u32, access: &SshAccess) -> Result<()> {
        let host = Self::host(agent)?;

        let mut session = self.sessions.open(host, &access.user, &access.auth).await?;
        let result = session.exec(&format!("kill -TERM {}", process_id)).await;
        session.close().await?;
        debug!(agent_id = %agent.id, pid = process_id, exited = !result?.success(), "Sent TERM");

        let sessions = self.sessions.as_ref();
        wait_until(
            &format!("process {} to exit", process_id),
            host,
            self.wait,
            move || async move {
                let mut session = sessions.open(host, &access.user, &access.auth).await?;
                let alive = session.exec(&format!("kill -0 {}", process_id)).await;
                session.close().await?;
                Ok(!alive?.success())
            },
        )
        .await?;

        info!(agent_id = %agent.id, pid = process_id, "Load generation stopped");
        Ok(())
    }
}
