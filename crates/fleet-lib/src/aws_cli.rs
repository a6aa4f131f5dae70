//! [`ComputeApi`] over the `aws` command line client
//!
//! Each call runs `aws ec2 <operation> ... --output json` with the client's
//! credentials and region in the child environment.

use crate::compute::{
    ComputeApi, ComputeClientFactory, Credentials, Instance, InstanceSpec, InstanceState, KeyPair,
    MachineImage, SecurityGroup, FLEET_TAG_KEY,
};
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Error codes meaning "no such resource"
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidKeyPair.NotFound",
    "InvalidAMIID.NotFound",
    "InvalidGroup.NotFound",
];

#[derive(Debug, Clone)]
pub struct AwsCliCompute {
    program: String,
    credentials: Credentials,
    region: String,
}

impl AwsCliCompute {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            program: "aws".to_string(),
            credentials,
            region: region.into(),
        }
    }

    /// Use a different `aws` executable
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn ec2(&self, operation: &str, args: &[&str]) -> Result<Value> {
        debug!(region = %self.region, operation = %operation, "Calling compute API");

        let output = Command::new(&self.program)
            .arg("ec2")
            .arg(operation)
            .args(args)
            .args(["--region", &self.region, "--output", "json"])
            .env("AWS_ACCESS_KEY_ID", &self.credentials.access_key)
            .env("AWS_SECRET_ACCESS_KEY", &self.credentials.secret_key)
            .env("AWS_DEFAULT_REGION", &self.region)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FleetError::cloud_api(operation, e.to_string()))?;

        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(region = %self.region, operation = %operation, error = %message, "Compute API call failed");
            return Err(FleetError::cloud_api(operation, message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| FleetError::cloud_api(operation, e.to_string()))
    }

    /// Like [`Self::ec2`], but maps "not found" errors to `None`
    async fn ec2_optional(&self, operation: &str, args: &[&str]) -> Result<Option<Value>> {
        match self.ec2(operation, args).await {
            Ok(value) => Ok(Some(value)),
            Err(FleetError::CloudApiFailure { message, .. })
                if NOT_FOUND_CODES.iter().any(|code| message.contains(code)) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn parse_instance(value: &Value) -> Option<Instance> {
    Some(Instance {
        id: str_at(value, "/InstanceId")?.to_string(),
        state: InstanceState::from_api(str_at(value, "/State/Name").unwrap_or("unknown")),
        public_ip_address: str_at(value, "/PublicIpAddress").map(str::to_string),
        private_ip_address: str_at(value, "/PrivateIpAddress").map(str::to_string),
    })
}

fn parse_reservations(value: &Value) -> Vec<Instance> {
    value
        .get("Reservations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("Instances").and_then(Value::as_array))
        .flatten()
        .filter_map(parse_instance)
        .collect()
}

fn parse_images(value: &Value) -> Vec<MachineImage> {
    value
        .get("Images")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|image| {
            Some(MachineImage {
                id: str_at(image, "/ImageId")?.to_string(),
                name: str_at(image, "/Name").unwrap_or_default().to_string(),
                state: str_at(image, "/State").unwrap_or("unknown").to_string(),
            })
        })
        .collect()
}

fn parse_key_pairs(value: &Value) -> Vec<KeyPair> {
    value
        .get("KeyPairs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|k| {
            Some(KeyPair {
                name: str_at(k, "/KeyName")?.to_string(),
            })
        })
        .collect()
}

fn parse_security_groups(value: &Value) -> Vec<SecurityGroup> {
    value
        .get("SecurityGroups")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|g| {
            Some(SecurityGroup {
                id: str_at(g, "/GroupId")?.to_string(),
                name: str_at(g, "/GroupName").unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// Running with both status checks passed
fn parse_instance_ready(value: &Value) -> bool {
    let status = match value
        .get("InstanceStatuses")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
    {
        Some(status) => status,
        None => return false,
    };

    str_at(status, "/InstanceState/Name") == Some("running")
        && str_at(status, "/SystemStatus/Status") == Some("ok")
        && str_at(status, "/InstanceStatus/Status") == Some("ok")
}

#[async_trait]
impl ComputeApi for AwsCliCompute {
    fn region(&self) -> &str {
        &self.region
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let tag_spec = format!(
            "ResourceType=instance,Tags=[{{Key=Name,Value={}}},{{Key={},Value={}}}]",
            spec.tag, FLEET_TAG_KEY, spec.tag
        );
        let placement = spec
            .availability_zone
            .as_ref()
            .map(|zone| format!("AvailabilityZone={}", zone));

        let mut args = vec![
            "--image-id",
            spec.image_id.as_str(),
            "--instance-type",
            spec.instance_type.as_str(),
            "--key-name",
            spec.key_name.as_str(),
            "--count",
            "1",
            "--tag-specifications",
            tag_spec.as_str(),
        ];
        if !spec.security_group_ids.is_empty() {
            args.push("--security-group-ids");
            args.extend(spec.security_group_ids.iter().map(String::as_str));
        }
        if let Some(subnet) = &spec.subnet_id {
            args.extend(["--subnet-id", subnet.as_str(), "--associate-public-ip-address"]);
        }
        if let Some(placement) = &placement {
            args.extend(["--placement", placement.as_str()]);
        }

        let value = self.ec2("run-instances", &args).await?;
        value
            .get("Instances")
            .and_then(Value::as_array)
            .and_then(|i| i.first())
            .and_then(parse_instance)
            .ok_or_else(|| FleetError::cloud_api("run-instances", "no instance in response"))
    }

    async fn find_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let value = self
            .ec2_optional("describe-instances", &["--instance-ids", instance_id])
            .await?;
        Ok(value.and_then(|v| parse_reservations(&v).into_iter().next()))
    }

    async fn list_tagged_instances(&self) -> Result<Vec<Instance>> {
        let filter = format!("Name=tag-key,Values={}", FLEET_TAG_KEY);
        let value = self
            .ec2("describe-instances", &["--filters", filter.as_str()])
            .await?;
        Ok(parse_reservations(&value))
    }

    async fn instance_ready(&self, instance_id: &str) -> Result<bool> {
        let value = self
            .ec2_optional(
                "describe-instance-status",
                &["--instance-ids", instance_id, "--include-all-instances"],
            )
            .await?;
        Ok(value.map(|v| parse_instance_ready(&v)).unwrap_or(false))
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.ec2("start-instances", &["--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.ec2("stop-instances", &["--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.ec2("terminate-instances", &["--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn find_key_pair(&self, name: &str) -> Result<Option<KeyPair>> {
        let value = self
            .ec2_optional("describe-key-pairs", &["--key-names", name])
            .await?;
        Ok(value.and_then(|v| parse_key_pairs(&v).into_iter().next()))
    }

    async fn list_key_pairs(&self) -> Result<Vec<KeyPair>> {
        let value = self.ec2("describe-key-pairs", &[]).await?;
        Ok(parse_key_pairs(&value))
    }

    async fn create_key_pair(&self, name: &str) -> Result<String> {
        let value = self
            .ec2("create-key-pair", &["--key-name", name])
            .await?;
        str_at(&value, "/KeyMaterial")
            .map(str::to_string)
            .ok_or_else(|| FleetError::cloud_api("create-key-pair", "no key material in response"))
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        self.ec2("delete-key-pair", &["--key-name", name])
            .await
            .map(|_| ())
    }

    async fn find_image(&self, name: &str) -> Result<Option<MachineImage>> {
        let filter = format!("Name=name,Values={}", name);
        let value = self
            .ec2(
                "describe-images",
                &["--owners", "self", "--filters", filter.as_str()],
            )
            .await?;
        Ok(parse_images(&value).into_iter().next())
    }

    async fn list_images(&self) -> Result<Vec<MachineImage>> {
        let value = self.ec2("describe-images", &["--owners", "self"]).await?;
        Ok(parse_images(&value))
    }

    async fn describe_image(&self, image_id: &str) -> Result<Option<MachineImage>> {
        let value = self
            .ec2_optional("describe-images", &["--image-ids", image_id])
            .await?;
        Ok(value.and_then(|v| parse_images(&v).into_iter().next()))
    }

    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String> {
        let value = self
            .ec2(
                "create-image",
                &["--instance-id", instance_id, "--name", name],
            )
            .await?;
        str_at(&value, "/ImageId")
            .map(str::to_string)
            .ok_or_else(|| FleetError::cloud_api("create-image", "no image id in response"))
    }

    async fn deregister_image(&self, image_id: &str) -> Result<()> {
        self.ec2("deregister-image", &["--image-id", image_id])
            .await
            .map(|_| ())
    }

    async fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>> {
        let filter = format!("Name=group-name,Values={}", name);
        let value = self
            .ec2("describe-security-groups", &["--filters", filter.as_str()])
            .await?;
        Ok(parse_security_groups(&value).into_iter().next())
    }

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>> {
        let value = self.ec2("describe-security-groups", &[]).await?;
        Ok(parse_security_groups(&value))
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<String> {
        let value = self
            .ec2(
                "create-security-group",
                &["--group-name", name, "--description", description],
            )
            .await?;
        let group_id = str_at(&value, "/GroupId")
            .map(str::to_string)
            .ok_or_else(|| {
                FleetError::cloud_api("create-security-group", "no group id in response")
            })?;

        self.ec2(
            "authorize-security-group-ingress",
            &[
                "--group-id",
                group_id.as_str(),
                "--protocol",
                "tcp",
                "--port",
                "22",
                "--cidr",
                "0.0.0.0/0",
            ],
        )
        .await?;

        Ok(group_id)
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        self.ec2("delete-security-group", &["--group-id", group_id])
            .await
            .map(|_| ())
    }
}

/// Factory producing [`AwsCliCompute`] clients
#[derive(Debug, Clone, Default)]
pub struct AwsCliFactory {
    program: Option<String>,
}

impl AwsCliFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }
}

impl ComputeClientFactory for AwsCliFactory {
    fn client(&self, credentials: &Credentials, region: &str) -> Arc<dyn ComputeApi> {
        let mut client = AwsCliCompute::new(credentials.clone(), region);
        if let Some(program) = &self.program {
            client = client.program(program.clone());
        }
        Arc::new(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reservations() {
        let value = json!({
            "Reservations": [{
                "Instances": [{
                    "InstanceId": "i-0abc",
                    "State": {"Name": "running"},
                    "PublicIpAddress": "54.1.2.3",
                    "PrivateIpAddress": "10.0.0.5"
                }]
            }, {
                "Instances": [{
                    "InstanceId": "i-0def",
                    "State": {"Name": "stopped"},
                    "PrivateIpAddress": "10.0.0.6"
                }]
            }]
        });

        let instances = parse_reservations(&value);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].state, InstanceState::Running);
        assert_eq!(instances[0].public_ip_address.as_deref(), Some("54.1.2.3"));
        assert_eq!(instances[1].state, InstanceState::Stopped);
        assert!(instances[1].public_ip_address.is_none());
    }

    #[test]
    fn test_instance_ready_requires_both_checks() {
        let ready = json!({"InstanceStatuses": [{
            "InstanceState": {"Name": "running"},
            "SystemStatus": {"Status": "ok"},
            "InstanceStatus": {"Status": "ok"}
        }]});
        let initializing = json!({"InstanceStatuses": [{
            "InstanceState": {"Name": "running"},
            "SystemStatus": {"Status": "ok"},
            "InstanceStatus": {"Status": "initializing"}
        }]});

        assert!(parse_instance_ready(&ready));
        assert!(!parse_instance_ready(&initializing));
        assert!(!parse_instance_ready(&json!({"InstanceStatuses": []})));
    }

    #[test]
    fn test_parse_images_and_groups() {
        let images = parse_images(&json!({"Images": [
            {"ImageId": "ami-1", "Name": "loadfleet-j5.4.1-x86_64", "State": "available"},
            {"ImageId": "ami-2", "Name": "other", "State": "pending"}
        ]}));
        assert_eq!(images.len(), 2);
        assert!(images[0].is_available());
        assert!(!images[1].is_available());

        let groups = parse_security_groups(&json!({"SecurityGroups": [
            {"GroupId": "sg-1", "GroupName": "loadfleet-agent"}
        ]}));
        assert_eq!(groups[0].id, "sg-1");
    }

    #[tokio::test]
    async fn test_missing_program_is_cloud_api_failure() {
        let client = AwsCliCompute::new(Credentials::new("a", "b"), "us-east-1")
            .program("/nonexistent/aws-binary");
        let err = client.list_key_pairs().await.unwrap_err();
        assert!(matches!(err, FleetError::CloudApiFailure { .. }));
    }
}
