//! Load agent lifecycle
//!
//! `Unprovisioned -> Provisioning -> Reachable -> Generating -> Idle -> Released`,
//! with `Released -> Provisioning` when a project is reactivated. Every
//! mutation of a [`LoadAgent`] goes through a transition method so the
//! address and process-handle invariants hold after each step.

use crate::error::{FleetError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a load agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// No machine assigned yet
    Unprovisioned,
    /// Back-end creation or assignment in progress
    Provisioning,
    /// Machine is up, reachable and prerequisite-verified
    Reachable,
    /// Load generation process is running
    Generating,
    /// Process exited or was stopped
    Idle,
    /// Back-end resource released
    Released,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Unprovisioned => "unprovisioned",
            AgentState::Provisioning => "provisioning",
            AgentState::Reachable => "reachable",
            AgentState::Generating => "generating",
            AgentState::Idle => "idle",
            AgentState::Released => "released",
        };
        write!(f, "{}", s)
    }
}

impl AgentState {
    /// Check if a transition to `target` is allowed
    pub fn can_transition_to(self, target: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, target),
            (Unprovisioned, Provisioning)
                | (Released, Provisioning)
                | (Provisioning, Reachable)
                // fail-fast: the caller sees an unprovisioned agent again
                | (Provisioning, Unprovisioned)
                | (Reachable, Generating)
                | (Idle, Generating)
                | (Generating, Idle)
                | (Reachable, Released)
                | (Idle, Released)
                | (Unprovisioned, Released)
        )
    }

    /// States in which the agent holds network addresses
    pub fn holds_addresses(self) -> bool {
        matches!(
            self,
            AgentState::Reachable | AgentState::Generating | AgentState::Idle
        )
    }
}

/// One provisioned machine capable of running the load-generation tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAgent {
    pub id: String,
    pub clusterable_id: String,
    pub test_plan: String,
    /// Back-end-native identifier (instance id or machine address)
    pub identifier: Option<String>,
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    /// Handle of the remote load generation process
    pub process_id: Option<u32>,
    pub active: bool,
    pub state: AgentState,
    pub last_transition_at: DateTime<Utc>,
}

impl LoadAgent {
    pub fn new(
        id: impl Into<String>,
        clusterable_id: impl Into<String>,
        test_plan: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            clusterable_id: clusterable_id.into(),
            test_plan: test_plan.into(),
            identifier: None,
            public_ip_address: None,
            private_ip_address: None,
            process_id: None,
            active: true,
            state: AgentState::Unprovisioned,
            last_transition_at: Utc::now(),
        }
    }

    /// Whether the agent has a live network address
    pub fn has_address(&self) -> bool {
        self.private_ip_address.is_some()
    }

    /// Whether a load generation process is running
    pub fn is_running(&self) -> bool {
        self.process_id.is_some()
    }

    /// Address used to open remote sessions
    pub fn ssh_address(&self) -> Option<&str> {
        self.public_ip_address
            .as_deref()
            .or(self.private_ip_address.as_deref())
    }

    fn transition(&mut self, target: AgentState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(FleetError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        self.last_transition_at = Utc::now();
        Ok(())
    }

    /// Begin back-end specific creation or assignment
    pub fn begin_provisioning(&mut self) -> Result<()> {
        self.transition(AgentState::Provisioning)
    }

    /// Record the machine as reachable and verified
    pub fn mark_reachable(
        &mut self,
        identifier: impl Into<String>,
        public_ip_address: Option<String>,
        private_ip_address: impl Into<String>,
    ) -> Result<()> {
        self.transition(AgentState::Reachable)?;
        self.identifier = Some(identifier.into());
        self.private_ip_address = Some(private_ip_address.into());
        self.public_ip_address = public_ip_address.or_else(|| self.private_ip_address.clone());
        Ok(())
    }

    /// Provisioning failed; addresses are dropped but an identifier is kept
    /// so a later cleanup can still find the partially created resource
    pub fn provisioning_failed(&mut self, retain_identifier: bool) {
        if self.state == AgentState::Provisioning {
            let _ = self.transition(AgentState::Unprovisioned);
        }
        self.public_ip_address = None;
        self.private_ip_address = None;
        if !retain_identifier {
            self.identifier = None;
        }
    }

    /// Record the launched load generation process
    pub fn start_generating(&mut self, process_id: u32) -> Result<()> {
        if !self.active {
            return Err(FleetError::validation(format!(
                "agent {} is inactive",
                self.id
            )));
        }
        self.transition(AgentState::Generating)?;
        self.process_id = Some(process_id);
        Ok(())
    }

    /// The process exited or was stopped
    pub fn finish_generating(&mut self) -> Result<()> {
        self.transition(AgentState::Idle)?;
        self.process_id = None;
        Ok(())
    }

    /// Back-end resource released; a retained identifier lets a stopped
    /// instance be restarted instead of recreated
    pub fn release(&mut self, retain_identifier: bool) -> Result<()> {
        if self.is_running() {
            return Err(FleetError::InvalidTransition {
                from: self.state.to_string(),
                to: AgentState::Released.to_string(),
            });
        }
        self.transition(AgentState::Released)?;
        self.public_ip_address = None;
        self.private_ip_address = None;
        if !retain_identifier {
            self.identifier = None;
        }
        Ok(())
    }

    /// Take the agent out of service
    pub fn deactivate(&mut self) -> Result<()> {
        if self.state.holds_addresses() || self.state == AgentState::Unprovisioned {
            self.release(true)?;
        }
        self.active = false;
        Ok(())
    }

    /// Check the address and process-handle invariants
    pub fn check_invariants(&self) -> Result<()> {
        let violation = match self.state {
            AgentState::Generating if self.process_id.is_none() || !self.has_address() => {
                Some("generating agent without process handle or address")
            }
            AgentState::Released if self.process_id.is_some() || self.has_address() => {
                Some("released agent still holds process handle or address")
            }
            _ if !self.active && (self.process_id.is_some() || self.has_address()) => {
                Some("inactive agent still holds process handle or address")
            }
            _ => None,
        };

        match violation {
            Some(message) => Err(FleetError::validation(format!(
                "agent {}: {}",
                self.id, message
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reachable_agent() -> LoadAgent {
        let mut agent = LoadAgent::new("a-1", "dc-1", "plan");
        agent.begin_provisioning().unwrap();
        agent
            .mark_reachable("i-1", Some("54.1.1.1".to_string()), "10.0.0.1")
            .unwrap();
        agent
    }

    #[test]
    fn test_full_lifecycle_preserves_invariants() {
        let mut agent = reachable_agent();
        assert_eq!(agent.state, AgentState::Reachable);
        agent.check_invariants().unwrap();

        agent.start_generating(4242).unwrap();
        assert_eq!(agent.state, AgentState::Generating);
        assert!(agent.process_id.is_some());
        assert!(agent.has_address());
        agent.check_invariants().unwrap();

        agent.finish_generating().unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.process_id.is_none());

        agent.release(false).unwrap();
        assert_eq!(agent.state, AgentState::Released);
        assert!(agent.process_id.is_none());
        assert!(!agent.has_address());
        assert!(agent.public_ip_address.is_none());
        agent.check_invariants().unwrap();
    }

    #[test]
    fn test_released_agent_can_be_reprovisioned() {
        let mut agent = reachable_agent();
        agent.release(true).unwrap();
        assert_eq!(agent.identifier.as_deref(), Some("i-1"));

        agent.begin_provisioning().unwrap();
        assert_eq!(agent.state, AgentState::Provisioning);
    }

    #[test]
    fn test_cannot_release_while_generating() {
        let mut agent = reachable_agent();
        agent.start_generating(1).unwrap();
        assert!(matches!(
            agent.release(false),
            Err(FleetError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_cannot_generate_before_reachable() {
        let mut agent = LoadAgent::new("a-1", "dc-1", "plan");
        assert!(agent.start_generating(1).is_err());
        assert_eq!(agent.state, AgentState::Unprovisioned);
    }

    #[test]
    fn test_provisioning_failure_returns_to_unprovisioned() {
        let mut agent = LoadAgent::new("a-1", "ec2-1", "plan");
        agent.begin_provisioning().unwrap();
        agent.identifier = Some("i-9".to_string());
        agent.private_ip_address = Some("10.0.0.9".to_string());

        agent.provisioning_failed(true);
        assert_eq!(agent.state, AgentState::Unprovisioned);
        assert!(!agent.has_address());
        assert_eq!(agent.identifier.as_deref(), Some("i-9"));
    }

    #[test]
    fn test_deactivate_clears_addresses() {
        let mut agent = reachable_agent();
        agent.deactivate().unwrap();
        assert!(!agent.active);
        assert!(!agent.has_address());
        agent.check_invariants().unwrap();
    }

    #[test]
    fn test_invariant_violation_detected() {
        let mut agent = reachable_agent();
        agent.state = AgentState::Released;
        assert!(agent.check_invariants().is_err());
    }
}
