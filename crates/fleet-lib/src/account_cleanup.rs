//! Account purge
//!
//! Removes every artifact the fleet created in a cloud account: tagged
//! instances, agent images, generated key pairs and agent security groups.
//! Artifacts are recognised by the fleet prefix, so resources the account
//! owner created by hand are never touched.

use crate::clusterable::FleetContext;
use crate::compute::{ComputeApi, ComputeClientFactory, Credentials, InstanceState};
use crate::error::Result;
use crate::models::ClusterConfig;
use crate::settings::ARTIFACT_PREFIX;
use crate::wait::wait_until;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// What a purge removed in one region
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub region: String,
    pub instances_terminated: usize,
    pub images_deregistered: usize,
    pub key_pairs_deleted: usize,
    pub security_groups_deleted: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.instances_terminated
            + self.images_deregistered
            + self.key_pairs_deleted
            + self.security_groups_deleted
    }
}

fn is_fleet_artifact(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX)
}

/// Regions referenced by each distinct credential pair of the elastic
/// clusterables
pub fn group_by_credentials(configs: &[ClusterConfig]) -> BTreeMap<Credentials, BTreeSet<String>> {
    let mut groups: BTreeMap<Credentials, BTreeSet<String>> = BTreeMap::new();
    for config in configs {
        if let ClusterConfig::ElasticCompute(elastic) = config {
            groups
                .entry(elastic.credentials())
                .or_default()
                .insert(elastic.region.clone());
        }
    }
    groups
}

pub struct AccountCleaner<'a> {
    ctx: &'a FleetContext,
}

impl<'a> AccountCleaner<'a> {
    pub fn new(ctx: &'a FleetContext) -> Self {
        Self { ctx }
    }

    /// Purge one region; instances go first since groups and keys in use
    /// cannot be deleted
    pub async fn clean_region(&self, compute: &dyn ComputeApi) -> Result<PurgeReport> {
        let region = compute.region().to_string();
        debug!(region = %region, "Purging fleet artifacts");
        let mut report = PurgeReport {
            region: region.clone(),
            ..Default::default()
        };

        let live: Vec<String> = compute
            .list_tagged_instances()
            .await?
            .into_iter()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.id)
            .collect();
        for id in &live {
            compute.terminate_instance(id).await?;
        }
        if !live.is_empty() {
            let pending = &live;
            wait_until(
                &format!("{} instances to terminate", live.len()),
                &region,
                self.ctx.settings.instance_ready_options(),
                move || async move {
                    for id in pending {
                        if let Some(instance) = compute.find_instance(id).await? {
                            if instance.state != InstanceState::Terminated {
                                return Ok(false);
                            }
                        }
                    }
                    Ok(true)
                },
            )
            .await?;
        }
        report.instances_terminated = live.len();

        for image in compute.list_images().await? {
            if is_fleet_artifact(&image.name) {
                compute.deregister_image(&image.id).await?;
                report.images_deregistered += 1;
            }
        }

        for key_pair in compute.list_key_pairs().await? {
            if is_fleet_artifact(&key_pair.name) {
                compute.delete_key_pair(&key_pair.name).await?;
                report.key_pairs_deleted += 1;
            }
        }

        for group in compute.list_security_groups().await? {
            if is_fleet_artifact(&group.name) {
                compute.delete_security_group(&group.id).await?;
                report.security_groups_deleted += 1;
            }
        }

        let metrics = &self.ctx.metrics;
        metrics.inc_purged_artifacts(&region, "instance", report.instances_terminated as u64);
        metrics.inc_purged_artifacts(&region, "image", report.images_deregistered as u64);
        metrics.inc_purged_artifacts(&region, "key_pair", report.key_pairs_deleted as u64);
        metrics.inc_purged_artifacts(
            &region,
            "security_group",
            report.security_groups_deleted as u64,
        );
        self.ctx.logger.log_account_purged(
            &region,
            report.images_deregistered,
            report.key_pairs_deleted,
            report.security_groups_deleted,
        );
        Ok(report)
    }
}

/// Purge every region of every credential pair referenced by `configs`
pub async fn purge_accounts(
    ctx: &FleetContext,
    compute: &Arc<dyn ComputeClientFactory>,
    configs: &[ClusterConfig],
) -> Result<Vec<PurgeReport>> {
    let cleaner = AccountCleaner::new(ctx);
    let mut reports = Vec::new();

    for (credentials, regions) in group_by_credentials(configs) {
        for region in regions {
            info!(account = %credentials.access_key, region = %region, "Purging account region");
            let client = compute.client(&credentials, &region);
            reports.push(cleaner.clean_region(client.as_ref()).await?);
        }
    }
    Ok(reports)
}
