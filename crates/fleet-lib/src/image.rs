//! Agent machine images for the elastic back-end
//!
//! Agents boot from an image that already carries the runtime and the load
//! generation tool. The image is looked up by name and built from a stock
//! base image when missing.

use crate::clusterable::FleetContext;
use crate::compute::{ComputeApi, Instance, InstanceSpec};
use crate::error::{FleetError, Result};
use crate::models::Project;
use crate::session::{ensure_reachable, SshAccess};
use crate::settings::ARTIFACT_PREFIX;
use crate::verifier::Prerequisites;
use crate::wait::wait_until;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Stock Ubuntu base images per region and architecture
const BASE_IMAGES: &[(&str, &str, &str)] = &[
    ("us-east-1", "x86_64", "ami-0c4f7023847b90238"),
    ("us-east-1", "arm64", "ami-0e2b332e63c56bcb5"),
    ("us-east-2", "x86_64", "ami-0eea504f45ef7a8f7"),
    ("us-east-2", "arm64", "ami-0bfe6a9d3b4b7fa9c"),
    ("us-west-1", "x86_64", "ami-0487b1fe60c1fd1a2"),
    ("us-west-2", "x86_64", "ami-0cb4e786f15603b0d"),
    ("us-west-2", "arm64", "ami-0a7ab5a4b6e8b6a2b"),
    ("eu-west-1", "x86_64", "ami-0a8e758f5e873d1c1"),
    ("eu-west-1", "arm64", "ami-0d75513e7706cf2d9"),
    ("eu-central-1", "x86_64", "ami-0e067cc8a2b58de59"),
    ("ap-south-1", "x86_64", "ami-0a23ccb2cdd9286bb"),
    ("ap-southeast-1", "x86_64", "ami-0750a20e9959e44ff"),
    ("ap-southeast-2", "x86_64", "ami-0b7dcd6e6fd797935"),
    ("ap-northeast-1", "x86_64", "ami-0d0c6a887ce442603"),
    ("sa-east-1", "x86_64", "ami-0b0d54b52c62864d6"),
];

fn graviton_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+\d+g").expect("valid instance class regex"))
}

/// CPU architecture of an instance type; Graviton classes (`t4g`, `m6g`,
/// `c7gn`) are arm64
pub fn arch_of(instance_type: &str) -> &'static str {
    let class = instance_type.split('.').next().unwrap_or_default();
    if graviton_regex().is_match(class) {
        "arm64"
    } else {
        "x86_64"
    }
}

pub fn base_image(region: &str, arch: &str) -> Option<&'static str> {
    BASE_IMAGES
        .iter()
        .find(|(r, a, _)| *r == region && *a == arch)
        .map(|(_, _, id)| *id)
}

/// `<prefix>-j<tool_version>[-<project_code>]-<arch>`; the project code is
/// part of the name only for project-specific tool builds
pub fn agent_image_name(project: &Project, arch: &str) -> String {
    let mut name = format!("{}-j{}", ARTIFACT_PREFIX, project.tool.version);
    if project.tool.is_custom() {
        name.push('-');
        name.push_str(&project.code);
    }
    name.push('-');
    name.push_str(arch);
    name
}

/// OS package providing a runtime version; `1.8` and `8` both map to JDK 8
pub fn runtime_package(runtime_version: &str) -> String {
    let major = match runtime_version.strip_prefix("1.") {
        Some(rest) => rest.split('.').next().unwrap_or(rest),
        None => runtime_version.split('.').next().unwrap_or(runtime_version),
    };
    format!("openjdk-{}-jre-headless", major)
}

/// Shell commands that install the runtime and the tool on a base image
pub fn install_commands(project: &Project) -> Vec<String> {
    let archive = format!("/tmp/{}.tgz", project.tool.directory());
    vec![
        "sudo apt-get update -y -q".to_string(),
        format!(
            "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y -q {}",
            runtime_package(&project.runtime_version)
        ),
        format!("wget -q '{}' -O {}", project.tool.download_url(), archive),
        format!("tar -xzf {} -C $HOME", archive),
        format!("rm -f {}", archive),
    ]
}

/// Instance launch parameters shared by builder and agent instances
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub instance_type: String,
    pub key_name: String,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub availability_zone: Option<String>,
    pub access: SshAccess,
}

impl LaunchTemplate {
    pub fn instance_spec(&self, image_id: &str, tag: &str) -> InstanceSpec {
        InstanceSpec {
            image_id: image_id.to_string(),
            instance_type: self.instance_type.clone(),
            key_name: self.key_name.clone(),
            security_group_ids: self.security_group_ids.clone(),
            subnet_id: self.subnet_id.clone(),
            availability_zone: self.availability_zone.clone(),
            tag: tag.to_string(),
        }
    }
}

pub struct ImageBuilder<'a> {
    compute: Arc<dyn ComputeApi>,
    ctx: &'a FleetContext,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(compute: Arc<dyn ComputeApi>, ctx: &'a FleetContext) -> Self {
        Self { compute, ctx }
    }

    /// Id of the agent image for `project`, building it if needed
    pub async fn ensure(
        &self,
        project: &Project,
        prerequisites: &Prerequisites,
        template: &LaunchTemplate,
    ) -> Result<String> {
        let arch = arch_of(&template.instance_type);
        let name = agent_image_name(project, arch);

        if let Some(image) = self.compute.find_image(&name).await? {
            if !image.is_available() {
                self.wait_available(&image.id).await?;
            }
            debug!(image = %name, image_id = %image.id, "Agent image exists");
            return Ok(image.id);
        }

        info!(region = %self.compute.region(), image = %name, "Building agent image");
        let base = base_image(self.compute.region(), arch).ok_or_else(|| {
            FleetError::validation(format!(
                "no base image for {} in {}",
                arch,
                self.compute.region()
            ))
        })?;

        let tag = format!("{}-image-builder", ARTIFACT_PREFIX);
        let instance = self
            .compute
            .create_instance(&template.instance_spec(base, &tag))
            .await?;

        let result = self
            .capture(&instance, &name, project, prerequisites, template)
            .await;

        // the builder instance is disposable on both outcomes
        if let Err(e) = self.compute.terminate_instance(&instance.id).await {
            warn!(instance_id = %instance.id, error = %e, "Failed to terminate image builder");
        }

        let image_id = result?;
        info!(region = %self.compute.region(), image = %name, image_id = %image_id, "Agent image available");
        Ok(image_id)
    }

    async fn capture(
        &self,
        instance: &Instance,
        name: &str,
        project: &Project,
        prerequisites: &Prerequisites,
        template: &LaunchTemplate,
    ) -> Result<String> {
        let region = self.compute.region().to_string();
        let compute = self.compute.clone();
        let id = instance.id.clone();
        wait_until(
            &format!("{} to start and successful system checks", instance.id),
            &region,
            self.ctx.settings.instance_ready_options(),
            || {
                let compute = compute.clone();
                let id = id.clone();
                async move { compute.instance_ready(&id).await }
            },
        )
        .await?;

        let running = self
            .compute
            .find_instance(&instance.id)
            .await?
            .ok_or_else(|| FleetError::cloud_api("describe-instances", format!("{} vanished", instance.id)))?;
        let host = running
            .public_ip_address
            .or(running.private_ip_address)
            .ok_or_else(|| FleetError::cloud_api("describe-instances", format!("{} has no address", instance.id)))?;

        ensure_reachable(
            self.ctx.sessions.as_ref(),
            &host,
            &template.access,
            self.ctx.settings.wait_options(),
        )
        .await?;

        let mut session = self
            .ctx
            .sessions
            .open(&host, &template.access.user, &template.access.auth)
            .await?;
        let installed = async {
            for command in install_commands(project) {
                session.exec_checked(&command).await?;
            }
            self.ctx
                .verifier
                .verify(session.as_mut(), prerequisites)
                .await
        }
        .await;
        session.close().await?;
        installed?;

        let image_id = self.compute.create_image(&instance.id, name).await?;
        self.wait_available(&image_id).await?;
        Ok(image_id)
    }

    async fn wait_available(&self, image_id: &str) -> Result<()> {
        let compute = self.compute.clone();
        let id = image_id.to_string();
        wait_until(
            &format!("image {} to be available", image_id),
            self.compute.region(),
            self.ctx.settings.instance_ready_options(),
            || {
                let compute = compute.clone();
                let id = id.clone();
                async move {
                    match compute.describe_image(&id).await? {
                        Some(image) if image.state == "failed" => Err(FleetError::cloud_api(
                            "create-image",
                            format!("image {} failed", id),
                        )),
                        Some(image) => Ok(image.is_available()),
                        None => Ok(false),
                    }
                }
            },
        )
        .await
        .map(|_| ())
    }
}
