//! Reconciliation orchestrator
//!
//! [`Client`] drives every resource kind through resolve, then provision,
//! then tag. It never caches remote identifiers: the only state it reads
//! between calls is the [`ClusterStatus`] handed in by the caller, and that
//! is only used to enforce cross-resource ordering.

use crate::capability::CloudCapabilities;
use crate::error::{CloudError, Result};
use crate::locks::KeyedLocks;
use crate::model::{
    AffinityGroup, AffinityGroupSpec, Cluster, ClusterStatus, CreateLoadBalancerRequest,
    CreateNetworkRequest, DeployRequest, Endpoint, Instance, LoadBalancerKey, LoadBalancerRule,
    MachineSpec, Ownership, Protocol, PublicIpStatus, RemoteFirewallRule,
    ResolvedNetwork, Resolved, ResourceKind, ResourceRef, Tagged, Zone,
};
use crate::provisioner::Provisioner;
use crate::report::{ActionType, PassReport};
use crate::resolver::Resolver;
use crate::retry::RetryConfig;
use crate::tags::{TagManager, TieBreak};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Offering used when an isolated network has to be created
pub const DEFAULT_NETWORK_OFFERING: &str = "DefaultIsolatedNetworkOfferingWithSourceNatService";

/// Tunables for a [`Client`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub tie_break: TieBreak,

    /// Retry policy for the tag step after a successful creation
    pub tag_retry: RetryConfig,

    pub network_offering: String,

    pub lb_algorithm: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::default(),
            tag_retry: RetryConfig::default(),
            network_offering: DEFAULT_NETWORK_OFFERING.to_string(),
            lb_algorithm: "roundrobin".to_string(),
        }
    }
}

pub struct Client<P: CloudCapabilities> {
    provider: P,
    options: ClientOptions,
    lb_locks: KeyedLocks,
}

impl<P: CloudCapabilities> Client<P> {
    pub fn new(provider: P) -> Self {
        Self::with_options(provider, ClientOptions::default())
    }

    pub fn with_options(provider: P, options: ClientOptions) -> Self {
        Self {
            provider,
            options,
            lb_locks: KeyedLocks::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn tags_for(&self, cluster: &Cluster) -> TagManager {
        TagManager::for_cluster(&cluster.cluster_ref)
            .with_retry(self.options.tag_retry.clone())
            .with_tie_break(self.options.tie_break)
    }

    /// Lightweight read-only probe of the remote API
    pub async fn check_connectivity(&self) -> Result<()> {
        self.provider.probe().await
    }

    // ============ Cluster lifecycle ============

    pub async fn resolve_zone(&self, cluster: &mut Cluster) -> Result<Zone> {
        self.zone_step(cluster, &mut PassReport::new()).await
    }

    async fn zone_step(&self, cluster: &mut Cluster, report: &mut PassReport) -> Result<Zone> {
        let tags = self.tags_for(cluster);
        let zone = Resolver::new(&self.provider, &tags)
            .zone(&cluster.spec.zone)
            .await?
            .ok_or_else(|| CloudError::not_found(ResourceKind::Zone, cluster.spec.zone.to_string()))?;

        cluster.status.zone_id = Some(zone.id.clone());
        report.record(ResourceKind::Zone, &zone.id, ActionType::Resolved, &zone.name);
        Ok(zone)
    }

    /// Run every infrastructure step in its fixed order
    pub async fn reconcile_cluster(&self, cluster: &mut Cluster) -> Result<PassReport> {
        let start = Instant::now();
        let mut report = PassReport::new();
        tracing::info!("Reconciling cluster {}", cluster.cluster_ref);

        self.zone_step(cluster, &mut report).await?;
        self.network_step(cluster, &mut report).await?;
        self.firewall_step(cluster, &mut report).await?;
        self.public_ip_step(cluster, &mut report).await?;
        self.load_balancer_step(cluster, &mut report).await?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Cluster {} reconciled: {} ({}ms)",
            cluster.cluster_ref,
            report.summary(),
            report.duration_ms
        );
        Ok(report)
    }

    /// Tear down owned infrastructure in reverse order
    ///
    /// Everything is re-resolved from remote state; foreign resources are
    /// reported as [`ActionType::Retained`] and left alone.
    pub async fn delete_cluster(&self, cluster: &mut Cluster) -> Result<PassReport> {
        let start = Instant::now();
        let mut report = PassReport::new();
        let tags = self.tags_for(cluster);
        let resolver = Resolver::new(&self.provider, &tags);
        tracing::info!("Deleting infrastructure of cluster {}", cluster.cluster_ref);

        let zone = resolver
            .zone(&cluster.spec.zone)
            .await?
            .ok_or_else(|| CloudError::not_found(ResourceKind::Zone, cluster.spec.zone.to_string()))?;

        let network = resolver
            .network(&zone.id, &cluster.spec.network)
            .await?
            .map(|found| {
                let ownership = teardown_ownership(&found, cluster.spec.network.is_provisionable());
                (found.resource, ownership)
            });
        let public_ip = match (&cluster.spec.control_plane_endpoint.host, &network) {
            (Some(host), _) => resolver
                .public_ip_by_address(&zone.id, host)
                .await?
                .map(|found| (found.resource, found.ownership)),
            (None, Some((network, ownership))) => {
                let owned = ownership.is_owned();
                resolver
                    .network_public_ip(&network.id, owned)
                    .await?
                    .map(|found| {
                        let ownership = teardown_ownership(&found, owned);
                        (found.resource, ownership)
                    })
            }
            (None, None) => None,
        };

        if let Some((ip, ip_ownership)) = &public_ip {
            let key = control_plane_key(&ip.id, cluster);
            if let Some(rule) = resolver.load_balancer_rule(&key).await? {
                let ownership = teardown_ownership(&rule, ip_ownership.is_owned());
                let id = rule.resource.id;
                self.remove(ResourceKind::LoadBalancerRule, &id, ownership, &mut report, || {
                    self.provider.delete_load_balancer_rule(&id)
                })
                .await?;
            }
        }

        if let Some((network, _)) = &network {
            // A multi-CIDR rule comes back once per CIDR under the same id
            let mut rules = BTreeMap::new();
            for rule in resolver.firewall_rules(&network.id).await? {
                rules.entry(rule.id.clone()).or_insert_with(|| tags.ownership_of(&rule));
            }
            for (id, ownership) in rules {
                self.remove(ResourceKind::FirewallRule, &id, ownership, &mut report, || {
                    self.provider.delete_firewall_rule(&id)
                })
                .await?;
            }
        }

        if let Some((ip, ownership)) = &public_ip {
            self.remove(ResourceKind::PublicIp, &ip.id, *ownership, &mut report, || {
                self.provider.disassociate_public_ip(&ip.id)
            })
            .await?;
        }

        if let Some((network, ownership)) = &network {
            self.remove(ResourceKind::Network, &network.id, *ownership, &mut report, || {
                self.provider.delete_network(&network.id)
            })
            .await?;
        }

        cluster.status = ClusterStatus::default();
        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Cluster {} torn down: {}",
            cluster.cluster_ref,
            report.summary()
        );
        Ok(report)
    }

    async fn remove<F, Fut>(
        &self,
        kind: ResourceKind,
        id: &str,
        ownership: Ownership,
        report: &mut PassReport,
        delete: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if ownership.is_owned() {
            delete().await?;
            tracing::info!("Deleted {} {}", kind, id);
            report.record(kind, id, ActionType::Deleted, "owned");
        } else {
            tracing::info!("Retaining foreign {} {}", kind, id);
            report.record(kind, id, ActionType::Retained, "not tagged for this cluster");
        }
        Ok(())
    }

    // ============ Network ============

    pub async fn resolve_or_create_network(&self, cluster: &mut Cluster) -> Result<ResolvedNetwork> {
        self.network_step(cluster, &mut PassReport::new()).await
    }

    async fn network_step(
        &self,
        cluster: &mut Cluster,
        report: &mut PassReport,
    ) -> Result<ResolvedNetwork> {
        let zone_id = require_zone(&cluster.status, "resolve_or_create_network")?;
        let tags = self.tags_for(cluster);
        let spec = &cluster.spec.network;

        let resolved = match Resolver::new(&self.provider, &tags).network(&zone_id, spec).await? {
            Some(found) if spec.is_provisionable() => {
                let (found, claimed) = Provisioner::new(&self.provider, &tags)
                    .finish(ResourceKind::Network, found)
                    .await?;
                let action = if claimed { ActionType::Claimed } else { ActionType::Resolved };
                report.record(
                    ResourceKind::Network,
                    &found.resource.id,
                    action,
                    format!("{} ({:?})", found.resource.name, found.ownership),
                );
                found
            }
            Some(found) => {
                report.record(
                    ResourceKind::Network,
                    &found.resource.id,
                    ActionType::Resolved,
                    format!("{} ({:?})", found.resource.name, found.ownership),
                );
                found
            }
            None => {
                if let Some(existing) = &spec.existing {
                    return Err(CloudError::not_found(ResourceKind::Network, existing.to_string()));
                }
                if !spec.is_provisionable() {
                    return Err(CloudError::not_found(ResourceKind::Network, spec.identity()));
                }

                let request = CreateNetworkRequest {
                    name: spec.name.clone(),
                    zone_id: zone_id.clone(),
                    cidr: spec.cidr.clone(),
                    offering: self.options.network_offering.clone(),
                };
                let network = Provisioner::new(&self.provider, &tags).network(&request).await?;
                report.record(ResourceKind::Network, &network.id, ActionType::Created, &network.name);
                Resolved {
                    resource: network,
                    ownership: Ownership::Owned,
                }
            }
        };

        let network = ResolvedNetwork::from_resolved(&resolved);
        cluster.status.network = Some(network.clone());
        Ok(network)
    }

    // ============ Firewall ============

    /// Create the required rules that the network does not have yet
    ///
    /// Returns only the rules created by this call. Rules present on the
    /// network but not required are left untouched.
    pub async fn open_firewall_rules(&self, cluster: &Cluster) -> Result<Vec<RemoteFirewallRule>> {
        self.firewall_step(cluster, &mut PassReport::new()).await
    }

    async fn firewall_step(
        &self,
        cluster: &Cluster,
        report: &mut PassReport,
    ) -> Result<Vec<RemoteFirewallRule>> {
        let network = require_network(&cluster.status, "open_firewall_rules")?;
        let tags = self.tags_for(cluster);

        let current: BTreeSet<_> = Resolver::new(&self.provider, &tags)
            .firewall_rules(&network.id)
            .await?
            .into_iter()
            .map(|r| r.rule)
            .collect();
        let missing: Vec<_> = cluster.spec.firewall_rules.difference(&current).collect();

        if missing.is_empty() {
            tracing::debug!("Firewall rules on network {} already satisfied", network.id);
            report.record(
                ResourceKind::FirewallRule,
                &network.id,
                ActionType::Unchanged,
                format!("{} rule(s) satisfied", cluster.spec.firewall_rules.len()),
            );
            return Ok(Vec::new());
        }

        let provisioner = Provisioner::new(&self.provider, &tags);
        let mut created = Vec::with_capacity(missing.len());
        for rule in missing {
            let remote = provisioner.firewall_rule(&network.id, rule).await?;
            report.record(
                ResourceKind::FirewallRule,
                &remote.id,
                ActionType::Created,
                rule.to_string(),
            );
            created.push(remote);
        }
        Ok(created)
    }

    // ============ Public IP ============

    /// Resolve (or allocate) the control-plane public IP
    ///
    /// Also writes the control-plane endpoint into the cluster status.
    pub async fn resolve_public_ip_details(&self, cluster: &mut Cluster) -> Result<PublicIpStatus> {
        self.public_ip_step(cluster, &mut PassReport::new()).await
    }

    async fn public_ip_step(
        &self,
        cluster: &mut Cluster,
        report: &mut PassReport,
    ) -> Result<PublicIpStatus> {
        const OPERATION: &str = "resolve_public_ip_details";
        let zone_id = require_zone(&cluster.status, OPERATION)?;
        let network = require_network(&cluster.status, OPERATION)?;
        let network_id = network.id.clone();
        let network_owned = network.ownership.is_owned();
        let tags = self.tags_for(cluster);
        let resolver = Resolver::new(&self.provider, &tags);
        let provisioner = Provisioner::new(&self.provider, &tags);

        let resolved = match &cluster.spec.control_plane_endpoint.host {
            Some(host) => resolver
                .public_ip_by_address(&zone_id, host)
                .await?
                .ok_or_else(|| CloudError::not_found(ResourceKind::PublicIp, host.as_str()))?,
            None => match resolver.network_public_ip(&network_id, network_owned).await? {
                Some(found) => {
                    let (found, claimed) = provisioner.finish(ResourceKind::PublicIp, found).await?;
                    if claimed {
                        report.record(
                            ResourceKind::PublicIp,
                            &found.resource.id,
                            ActionType::Claimed,
                            &found.resource.address,
                        );
                    }
                    found
                }
                None => {
                    let ip = provisioner.public_ip(&network_id).await?;
                    report.record(ResourceKind::PublicIp, &ip.id, ActionType::Created, &ip.address);
                    Resolved {
                        resource: ip,
                        ownership: Ownership::Owned,
                    }
                }
            },
        };

        if report.find(ResourceKind::PublicIp).is_none() {
            report.record(
                ResourceKind::PublicIp,
                &resolved.resource.id,
                ActionType::Resolved,
                &resolved.resource.address,
            );
        }

        let ip = resolved.resource;
        let status = PublicIpStatus {
            id: ip.id,
            network_id: ip.network_id.unwrap_or(network_id),
            address: ip.address,
            ownership: resolved.ownership,
        };
        cluster.status.control_plane_endpoint = Some(Endpoint {
            host: status.address.clone(),
            port: cluster.spec.control_plane_endpoint.port,
        });
        cluster.status.public_ip = Some(status.clone());
        Ok(status)
    }

    // ============ Load balancing ============

    /// Resolve or create the API server rule for (public IP, port, tcp)
    ///
    /// Calls for the same triple are serialised in-process. A creation the
    /// platform rejects is followed by one re-resolution, so a rule created
    /// concurrently by another process is returned instead of the error.
    pub async fn resolve_or_create_load_balancer_rule(
        &self,
        cluster: &mut Cluster,
    ) -> Result<LoadBalancerRule> {
        self.load_balancer_step(cluster, &mut PassReport::new()).await
    }

    async fn load_balancer_step(
        &self,
        cluster: &mut Cluster,
        report: &mut PassReport,
    ) -> Result<LoadBalancerRule> {
        const OPERATION: &str = "resolve_or_create_load_balancer_rule";
        let network_id = require_network(&cluster.status, OPERATION)?.id.clone();
        let public_ip = cluster.status.public_ip.as_ref().ok_or_else(|| {
            CloudError::precondition(OPERATION, "public IP has not been resolved")
        })?;

        let key = control_plane_key(&public_ip.id, cluster);
        let ip_owned = public_ip.ownership.is_owned();
        let tags = self.tags_for(cluster);
        let resolver = Resolver::new(&self.provider, &tags);
        let _guard = self.lb_locks.lock(&key.to_string()).await;

        let rule = match resolver.load_balancer_rule(&key).await? {
            Some(found) => {
                // Only this cluster creates rules on an address it owns
                let (found, claimed) = if ip_owned {
                    Provisioner::new(&self.provider, &tags)
                        .finish(ResourceKind::LoadBalancerRule, found)
                        .await?
                } else {
                    (found, false)
                };
                let action = if claimed { ActionType::Claimed } else { ActionType::Resolved };
                report.record(
                    ResourceKind::LoadBalancerRule,
                    &found.resource.id,
                    action,
                    key.to_string(),
                );
                found.resource
            }
            None => {
                let request = CreateLoadBalancerRequest {
                    name: format!("{}-apiserver", cluster.cluster_ref.name),
                    key: key.clone(),
                    private_port: key.public_port,
                    network_id,
                    algorithm: self.options.lb_algorithm.clone(),
                };
                match Provisioner::new(&self.provider, &tags)
                    .load_balancer_rule(&request)
                    .await
                {
                    Ok(rule) => {
                        report.record(
                            ResourceKind::LoadBalancerRule,
                            &rule.id,
                            ActionType::Created,
                            key.to_string(),
                        );
                        rule
                    }
                    Err(err @ CloudError::Rejected { .. }) => {
                        tracing::warn!("Load balancer rule for {} rejected, re-resolving: {}", key, err);
                        let found = resolver.load_balancer_rule(&key).await?.ok_or(err)?;
                        report.record(
                            ResourceKind::LoadBalancerRule,
                            &found.resource.id,
                            ActionType::Resolved,
                            key.to_string(),
                        );
                        found.resource
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        cluster.status.load_balancer_rule_id = Some(rule.id.clone());
        Ok(rule)
    }

    /// Bind a VM to the cluster's API server rule; returns false when already bound
    pub async fn assign_vm_to_load_balancer_rule(
        &self,
        cluster: &Cluster,
        instance_id: &str,
    ) -> Result<bool> {
        let rule_id = cluster.status.load_balancer_rule_id.as_deref().ok_or_else(|| {
            CloudError::precondition(
                "assign_vm_to_load_balancer_rule",
                "load balancer rule has not been resolved",
            )
        })?;

        let members = self.provider.list_load_balancer_instances(rule_id).await?;
        if members.iter().any(|m| m == instance_id) {
            tracing::debug!("VM {} already assigned to rule {}", instance_id, rule_id);
            return Ok(false);
        }

        self.provider
            .assign_to_load_balancer_rule(rule_id, &[instance_id.to_string()])
            .await?;
        tracing::info!("Assigned VM {} to load balancer rule {}", instance_id, rule_id);
        Ok(true)
    }

    // ============ Affinity groups ============

    pub async fn resolve_or_create_affinity_group(
        &self,
        cluster: &Cluster,
        spec: &AffinityGroupSpec,
    ) -> Result<Resolved<AffinityGroup>> {
        let tags = self.tags_for(cluster);
        let provisioner = Provisioner::new(&self.provider, &tags);
        if let Some(found) = Resolver::new(&self.provider, &tags).affinity_group(spec).await? {
            let (found, _) = provisioner.finish(ResourceKind::AffinityGroup, found).await?;
            return Ok(found);
        }

        let group = provisioner.affinity_group(spec).await?;
        Ok(Resolved {
            resource: group,
            ownership: Ownership::Owned,
        })
    }

    /// Delete the group if this cluster owns it
    ///
    /// Returns `Deleted`, `Retained` for a foreign group, or `Unchanged` when
    /// no such group exists.
    pub async fn delete_affinity_group(
        &self,
        cluster: &Cluster,
        spec: &AffinityGroupSpec,
    ) -> Result<ActionType> {
        let tags = self.tags_for(cluster);
        let Some(found) = Resolver::new(&self.provider, &tags).affinity_group(spec).await? else {
            return Ok(ActionType::Unchanged);
        };

        if !teardown_ownership(&found, true).is_owned() {
            tracing::info!("Retaining foreign affinity group {}", found.resource.id);
            return Ok(ActionType::Retained);
        }

        self.provider.delete_affinity_group(&found.resource.id).await?;
        tracing::info!("Deleted affinity group {} ({})", spec.name, found.resource.id);
        Ok(ActionType::Deleted)
    }

    // ============ VM lifecycle ============

    pub async fn resolve_or_create_vm(
        &self,
        cluster: &Cluster,
        machine: &MachineSpec,
    ) -> Result<Resolved<Instance>> {
        const OPERATION: &str = "resolve_or_create_vm";
        let zone_id = require_zone(&cluster.status, OPERATION)?;
        let network_id = require_network(&cluster.status, OPERATION)?.id.clone();
        let tags = self.tags_for(cluster);
        let resolver = Resolver::new(&self.provider, &tags);

        if let Some(found) = resolver.instance(&zone_id, &machine.name).await? {
            let (found, _) = Provisioner::new(&self.provider, &tags)
                .finish(ResourceKind::Instance, found)
                .await?;
            return Ok(found);
        }

        let offering_id = resolver.service_offering(&machine.offering).await?;
        let template_id = resolver.template(&zone_id, &machine.template).await?;

        let mut affinity_group_ids = Vec::with_capacity(machine.affinity_groups.len());
        for name in &machine.affinity_groups {
            let group = resolver
                .affinity_group_by_name(name)
                .await?
                .ok_or_else(|| CloudError::not_found(ResourceKind::AffinityGroup, name.as_str()))?;
            affinity_group_ids.push(group.resource.id);
        }

        let request = DeployRequest {
            name: machine.name.clone(),
            zone_id,
            offering_id,
            template_id,
            network_id,
            affinity_group_ids,
            user_data: machine.user_data.clone(),
            ssh_key: machine.ssh_key.clone(),
        };
        let vm = Provisioner::new(&self.provider, &tags).instance(&request).await?;
        Ok(Resolved {
            resource: vm,
            ownership: Ownership::Owned,
        })
    }

    /// Expunge an owned VM; returns false when no VM has that name
    pub async fn destroy_vm(&self, cluster: &Cluster, name: &str) -> Result<bool> {
        let zone_id = require_zone(&cluster.status, "destroy_vm")?;
        let tags = self.tags_for(cluster);

        let Some(found) = Resolver::new(&self.provider, &tags).instance(&zone_id, name).await? else {
            return Ok(false);
        };
        if !teardown_ownership(&found, true).is_owned() {
            return Err(CloudError::precondition(
                "destroy_vm",
                format!(
                    "{} is not tagged for cluster {}",
                    ResourceRef::new(ResourceKind::Instance, &found.resource.id),
                    cluster.cluster_ref
                ),
            ));
        }

        self.provider.destroy_instance(&found.resource.id).await?;
        tracing::info!("Destroyed VM {} ({})", name, found.resource.id);
        Ok(true)
    }
}

/// Ownership used when deleting a resolved resource
///
/// When the cluster would have created the resource itself, an unmarked match
/// is a creation whose tagging failed and is torn down like an owned one.
fn teardown_ownership<T: Tagged>(found: &Resolved<T>, created_on_demand: bool) -> Ownership {
    if created_on_demand && TagManager::is_unmarked(&found.resource) {
        Ownership::Owned
    } else {
        found.ownership
    }
}

fn control_plane_key(public_ip_id: &str, cluster: &Cluster) -> LoadBalancerKey {
    LoadBalancerKey {
        public_ip_id: public_ip_id.to_string(),
        public_port: cluster.spec.control_plane_endpoint.port,
        protocol: Protocol::Tcp,
    }
}

fn require_zone(status: &ClusterStatus, operation: &str) -> Result<String> {
    status
        .zone_id
        .clone()
        .ok_or_else(|| CloudError::precondition(operation, "zone has not been resolved"))
}

fn require_network<'s>(status: &'s ClusterStatus, operation: &str) -> Result<&'s ResolvedNetwork> {
    status
        .network
        .as_ref()
        .ok_or_else(|| CloudError::precondition(operation, "network has not been resolved"))
}
