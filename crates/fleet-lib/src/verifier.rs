//! Prerequisite verification on load agents
//!
//! Every agent must have the runtime and the load-generation tool at the
//! exact project versions before it may generate load. All probes run over
//! one remote session.

use crate::error::{FleetError, Result};
use crate::models::Project;
use crate::session::RemoteSession;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Versions an agent must satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisites {
    pub runtime_version: String,
    pub tool_version: String,
    /// Tool installation directory on the agent
    pub tool_home: String,
}

impl Prerequisites {
    pub fn for_project(project: &Project) -> Self {
        Self {
            runtime_version: project.runtime_version.clone(),
            tool_version: project.tool.version.clone(),
            tool_home: project.tool.home_dir(),
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    /// Fail with `RuntimeVersionFailure` or `ToolVersionFailure` unless the
    /// agent behind `session` satisfies `prerequisites`
    async fn verify(
        &self,
        session: &mut dyn RemoteSession,
        prerequisites: &Prerequisites,
    ) -> Result<()>;
}

fn version_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:[._]\d+)*").expect("valid version regex"))
}

fn labelled_version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)version\s+"?(\d+(?:[._]\d+)*)"#).expect("valid labelled version regex")
    })
}

/// Whether `found` is `expected` or a more specific release of it:
/// "1.8.0_212" satisfies "1.8", "1.80" does not
pub fn version_satisfies(found: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    found == expected
        || [".", "_", "-"]
            .iter()
            .any(|sep| found.starts_with(&format!("{}{}", expected, sep)))
}

/// Check runtime version output, e.g. `openjdk version "1.8.0_212"` or a
/// bare `1.8.0_212`. The version labelled as such wins over other numbers.
pub fn runtime_version_matches(output: &str, expected: &str) -> bool {
    let found = labelled_version_regex()
        .captures(output)
        .and_then(|c| c.get(1))
        .or_else(|| version_token_regex().find(output))
        .map(|m| m.as_str());

    match found {
        Some(found) => version_satisfies(found, expected),
        None => false,
    }
}

/// Check tool version output; tools print banners, so any labelled version
/// or, failing that, any version-like token may match
pub fn tool_version_matches(output: &str, expected: &str) -> bool {
    let labelled: Vec<&str> = labelled_version_regex()
        .captures_iter(output)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    if !labelled.is_empty() {
        return labelled.iter().any(|v| version_satisfies(v, expected));
    }

    version_token_regex()
        .find_iter(output)
        .any(|m| version_satisfies(m.as_str(), expected))
}

/// Verifier for a JVM runtime and an Apache JMeter installation
#[derive(Debug, Clone, Default)]
pub struct PrerequisiteVerifier;

impl PrerequisiteVerifier {
    pub fn new() -> Self {
        Self
    }

    async fn runtime_ok(session: &mut dyn RemoteSession, expected: &str) -> Result<bool> {
        let installed = session.exec("command -v java").await?;
        if !installed.success() || !installed.output.contains("java") {
            debug!(host = %session.host(), "Runtime not installed");
            return Ok(false);
        }

        let version = session.exec("java -version 2>&1").await?;
        Ok(runtime_version_matches(&version.output, expected))
    }

    async fn tool_ok(
        session: &mut dyn RemoteSession,
        tool_home: &str,
        expected: &str,
    ) -> Result<bool> {
        let probe = session
            .exec(&format!("{}/bin/jmeter -n -v 2>&1", tool_home))
            .await?;

        if !probe.output.contains("Apache Software Foundation") {
            debug!(host = %session.host(), "Load generation tool not installed");
            return Ok(false);
        }
        Ok(tool_version_matches(&probe.output, expected))
    }
}

#[async_trait]
impl Verifier for PrerequisiteVerifier {
    async fn verify(
        &self,
        session: &mut dyn RemoteSession,
        prerequisites: &Prerequisites,
    ) -> Result<()> {
        let host = session.host().to_string();
        debug!(host = %host, "Verifying prerequisites");

        if !Self::runtime_ok(session, &prerequisites.runtime_version).await? {
            return Err(FleetError::RuntimeVersionFailure {
                host,
                expected: prerequisites.runtime_version.clone(),
            });
        }

        if !Self::tool_ok(
            session,
            &prerequisites.tool_home,
            &prerequisites.tool_version,
        )
        .await?
        {
            return Err(FleetError::ToolVersionFailure {
                host,
                expected: prerequisites.tool_version.clone(),
            });
        }

        info!(
            host = %host,
            runtime = %prerequisites.runtime_version,
            tool = %prerequisites.tool_version,
            "Prerequisites verified"
        );
        Ok(())
    }
}
