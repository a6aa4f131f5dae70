//! Elastic compute API abstraction
//!
//! The elastic back-end, the agent image builder and account cleanup only
//! talk to the [`ComputeApi`] trait. A client is bound to one set of
//! credentials and one region.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Tag key set on every instance the fleet launches
pub const FLEET_TAG_KEY: &str = "loadfleet:project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown,
}

impl InstanceState {
    pub fn from_api(name: &str) -> Self {
        match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }

    /// Whether the instance is gone or on its way out
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
}

/// Launch parameters for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub availability_zone: Option<String>,
    /// Value of the fleet tag
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineImage {
    pub id: String,
    pub name: String,
    pub state: String,
}

impl MachineImage {
    pub fn is_available(&self) -> bool {
        self.state == "available"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

/// Account credentials; the secret never appears in debug output
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Client for one region of one account
#[async_trait]
pub trait ComputeApi: Send + Sync {
    fn region(&self) -> &str;

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;

    /// `None` if the instance does not exist (any more)
    async fn find_instance(&self, instance_id: &str) -> Result<Option<Instance>>;

    /// Instances carrying the fleet tag, in any state
    async fn list_tagged_instances(&self) -> Result<Vec<Instance>>;

    /// Running and passing its system and instance status checks
    async fn instance_ready(&self, instance_id: &str) -> Result<bool>;

    async fn start_instance(&self, instance_id: &str) -> Result<()>;

    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    async fn find_key_pair(&self, name: &str) -> Result<Option<KeyPair>>;

    async fn list_key_pairs(&self) -> Result<Vec<KeyPair>>;

    /// Create a key pair, returning the private key material
    async fn create_key_pair(&self, name: &str) -> Result<String>;

    async fn delete_key_pair(&self, name: &str) -> Result<()>;

    async fn find_image(&self, name: &str) -> Result<Option<MachineImage>>;

    /// Images owned by the account
    async fn list_images(&self) -> Result<Vec<MachineImage>>;

    async fn describe_image(&self, image_id: &str) -> Result<Option<MachineImage>>;

    /// Create an image from an instance, returning the image id
    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String>;

    async fn deregister_image(&self, image_id: &str) -> Result<()>;

    async fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>>;

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>>;

    /// Create a group allowing inbound SSH, returning the group id
    async fn create_security_group(&self, name: &str, description: &str) -> Result<String>;

    async fn delete_security_group(&self, group_id: &str) -> Result<()>;
}

/// Builds clients bound to credentials and region
pub trait ComputeClientFactory: Send + Sync {
    fn client(&self, credentials: &Credentials, region: &str) -> Arc<dyn ComputeApi>;
}
