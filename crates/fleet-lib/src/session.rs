//! Remote shell sessions to load agent machines
//!
//! A session is an authenticated OpenSSH control master. Commands run as
//! multiplexed clients over the master, and the master is shut down when
//! the session is closed or dropped, so the transport is released even
//! when a command fails halfway through a workflow.

use crate::error::{FleetError, Result};
use crate::wait::{wait_until, WaitOptions};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output of one remote command; stdout and stderr are combined since
/// version probes commonly report on stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_status: Option<i32>,
}

impl CommandOutput {
    pub fn new(output: impl Into<String>, exit_status: Option<i32>) -> Self {
        Self {
            output: output.into(),
            exit_status,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Authentication options for opening a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAuth {
    pub identity_file: PathBuf,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl SshAuth {
    pub fn new(identity_file: impl Into<PathBuf>) -> Self {
        Self {
            identity_file: identity_file.into(),
            port: 22,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// User and credentials a clusterable uses for its machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAccess {
    pub user: String,
    pub auth: SshAuth,
}

/// An open remote shell
#[async_trait]
pub trait RemoteSession: Send {
    /// Host this session is connected to
    fn host(&self) -> &str;

    /// Run a command, returning its output whatever the exit status
    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Run a command and fail with `RemoteCommandFailure` on non-zero exit
    async fn exec_checked(&mut self, command: &str) -> Result<CommandOutput> {
        let output = self.exec(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(FleetError::RemoteCommandFailure {
                host: self.host().to_string(),
                command: command.to_string(),
                status: output.exit_status,
                output: output.output,
            })
        }
    }

    /// Release the transport
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens remote sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, host: &str, user: &str, auth: &SshAuth) -> Result<Box<dyn RemoteSession>>;
}

/// Wait until a session can be opened and a trivial command succeeds.
/// Connection and authentication failures are retried within the budget.
pub async fn ensure_reachable(
    sessions: &dyn SessionFactory,
    host: &str,
    access: &SshAccess,
    options: WaitOptions,
) -> Result<()> {
    debug!(host = %host, "Ensuring remote session access");
    wait_until(&format!("session access to {}", host), host, options, move || async move {
        let mut session = sessions.open(host, &access.user, &access.auth).await?;
        let result = session.exec("true").await;
        session.close().await?;
        Ok(result?.success())
    })
    .await
    .map(|_| ())
}

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Session factory backed by the system `ssh` client
#[derive(Debug, Clone)]
pub struct OpenSshSessionFactory {
    program: String,
    control_dir: PathBuf,
}

impl Default for OpenSshSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenSshSessionFactory {
    pub fn new() -> Self {
        Self {
            program: "ssh".to_string(),
            control_dir: std::env::temp_dir(),
        }
    }

    /// Use a different ssh executable
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Directory for control sockets
    pub fn control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    fn control_path(&self, host: &str) -> PathBuf {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let host: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(32)
            .collect();
        self.control_dir
            .join(format!("fleet-{}-{}-{}.sock", std::process::id(), host, seq))
    }
}

fn ssh_options(auth: &SshAuth) -> Vec<String> {
    vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        format!("ConnectTimeout={}", auth.connect_timeout.as_secs().max(1)),
        "-o".into(),
        "ServerAliveInterval=30".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-p".into(),
        auth.port.to_string(),
        "-i".into(),
        auth.identity_file.to_string_lossy().into_owned(),
    ]
}

/// Map the diagnostics of a failed ssh invocation onto the error taxonomy
pub fn classify_ssh_failure(host: &str, user: &str, diagnostics: &str) -> FleetError {
    const AUTH_MARKERS: &[&str] = &[
        "Permission denied",
        "Authentication failed",
        "Too many authentication failures",
        "no such identity",
    ];

    if AUTH_MARKERS.iter().any(|m| diagnostics.contains(m)) {
        return FleetError::AuthFailure {
            host: host.to_string(),
            user: user.to_string(),
        };
    }

    let reason = diagnostics
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("ssh exited without diagnostics")
        .to_string();

    FleetError::ConnectionFailure {
        host: host.to_string(),
        reason,
    }
}

#[async_trait]
impl SessionFactory for OpenSshSessionFactory {
    async fn open(&self, host: &str, user: &str, auth: &SshAuth) -> Result<Box<dyn RemoteSession>> {
        let control_path = self.control_path(host);
        let log_path = control_path.with_extension("log");
        let destination = format!("{}@{}", user, host);

        debug!(host = %host, user = %user, "Opening remote session");

        // -f backgrounds the master once authenticated, so the exit status
        // of this invocation tells whether the connection was established
        let status = Command::new(&self.program)
            .args(ssh_options(auth))
            .args(["-M", "-N", "-f", "-o", "ControlPersist=no", "-S"])
            .arg(&control_path)
            .arg("-E")
            .arg(&log_path)
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        let diagnostics = tokio::fs::read_to_string(&log_path)
            .await
            .unwrap_or_default();
        let _ = tokio::fs::remove_file(&log_path).await;

        if !status.success() {
            let err = classify_ssh_failure(host, user, &diagnostics);
            debug!(host = %host, error = %err, "Remote session could not be opened");
            return Err(err);
        }

        Ok(Box::new(OpenSshSession {
            program: self.program.clone(),
            host: host.to_string(),
            user: user.to_string(),
            destination,
            control_path,
            closed: false,
        }))
    }
}

/// Session multiplexed over an OpenSSH control master
pub struct OpenSshSession {
    program: String,
    host: String,
    user: String,
    destination: String,
    control_path: PathBuf,
    closed: bool,
}

impl OpenSshSession {
    fn exit_master_blocking(program: &str, control_path: &Path, destination: &str) {
        let _ = std::process::Command::new(program)
            .arg("-S")
            .arg(control_path)
            .args(["-O", "exit"])
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let _ = std::fs::remove_file(control_path);
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, command = %command, "Executing remote command");

        let output = Command::new(&self.program)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-o", "ControlMaster=no", "-o", "LogLevel=ERROR"])
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // 255 is reserved by ssh for its own failures
        if output.status.code() == Some(255) && stdout.trim().is_empty() {
            return Err(classify_ssh_failure(&self.host, &self.user, &stderr));
        }

        Ok(CommandOutput::new(
            format!("{}{}", stdout, stderr),
            output.status.code(),
        ))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.closed = true;
        let status = Command::new(&self.program)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let _ = tokio::fs::remove_file(&self.control_path).await;

        if let Err(e) = status {
            warn!(host = %self.host, error = %e, "Failed to shut down session master");
        }
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if !self.closed {
            Self::exit_master_blocking(&self.program, &self.control_path, &self.destination);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_failure() {
        let err = classify_ssh_failure(
            "10.0.0.1",
            "ubuntu",
            "ubuntu@10.0.0.1: Permission denied (publickey).",
        );
        assert!(matches!(err, FleetError::AuthFailure { .. }));
    }

    #[test]
    fn test_classify_connection_failure_keeps_last_line() {
        let err = classify_ssh_failure(
            "10.0.0.1",
            "ubuntu",
            "\nssh: connect to host 10.0.0.1 port 22: Connection refused\n",
        );
        match err {
            FleetError::ConnectionFailure { reason, .. } => {
                assert!(reason.contains("Connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_empty_diagnostics() {
        let err = classify_ssh_failure("10.0.0.1", "ubuntu", "");
        assert!(err.is_transient());
    }

    #[test]
    fn test_ssh_options_include_identity_and_port() {
        let auth = SshAuth::new("/keys/server.pem")
            .port(2222)
            .connect_timeout(Duration::from_secs(7));
        let opts = ssh_options(&auth);
        assert!(opts.contains(&"/keys/server.pem".to_string()));
        assert!(opts.contains(&"2222".to_string()));
        assert!(opts.contains(&"ConnectTimeout=7".to_string()));
        assert!(opts.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_control_paths_are_unique() {
        let factory = OpenSshSessionFactory::new().control_dir("/tmp");
        let a = factory.control_path("10.0.0.1");
        let b = factory.control_path("10.0.0.1");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("10_0_0_1"));
    }

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::new("ok", Some(0)).success());
        assert!(!CommandOutput::new("missing", Some(1)).success());
        assert!(!CommandOutput::new("", None).success());
    }
}
