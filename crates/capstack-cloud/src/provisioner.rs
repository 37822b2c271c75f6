//! Per-kind provisioning: create, then tag, as one logical step
//!
//! A resource is only handed back once it carries the ownership tag. When
//! tagging keeps failing the caller gets
//! [`CloudError::PartialProvisioning`](crate::CloudError::PartialProvisioning)
//! naming the created resource instead.

use crate::capability::{
    AffinityGroupCapability, FirewallCapability, LoadBalancerCapability, NetworkCapability,
    PublicIpCapability, TagCapability, VmCapability,
};
use crate::error::Result;
use crate::model::{
    AffinityGroup, AffinityGroupSpec, CreateLoadBalancerRequest, CreateNetworkRequest,
    DeployRequest, FirewallRule, Instance, LoadBalancerRule, Network, Ownership, PublicIp,
    RemoteFirewallRule, ResourceKind, ResourceRef, Resolved, Tagged,
};
use crate::tags::TagManager;

pub struct Provisioner<'a, P: ?Sized> {
    api: &'a P,
    tags: &'a TagManager,
}

impl<'a, P> Provisioner<'a, P>
where
    P: TagCapability + ?Sized,
{
    pub fn new(api: &'a P, tags: &'a TagManager) -> Self {
        Self { api, tags }
    }

    async fn claim<T: Tagged>(&self, kind: ResourceKind, mut resource: T) -> Result<T> {
        let reference = ResourceRef::new(kind, resource.id());
        self.tags.tag_created(self.api, &reference).await?;

        let owner = self.tags.owner_tag();
        if !TagManager::has_tag(&resource, owner) {
            resource.tags_mut().push(owner.clone());
        }
        Ok(resource)
    }

    /// Tag a match that an earlier pass created but never tagged
    ///
    /// Only unmarked resources are claimed; the flag says whether this call
    /// tagged it. Owned resources and ones carrying another cluster's tag are
    /// returned unchanged.
    pub async fn finish<T: Tagged>(
        &self,
        kind: ResourceKind,
        found: Resolved<T>,
    ) -> Result<(Resolved<T>, bool)> {
        if found.ownership.is_owned() || !TagManager::is_unmarked(&found.resource) {
            return Ok((found, false));
        }

        tracing::info!("Claiming untagged {} {} left by an earlier pass", kind, found.resource.id());
        let resource = self.claim(kind, found.resource).await?;
        Ok((
            Resolved {
                resource,
                ownership: Ownership::Owned,
            },
            true,
        ))
    }

    pub async fn network(&self, request: &CreateNetworkRequest) -> Result<Network>
    where
        P: NetworkCapability,
    {
        tracing::info!("Creating network {} in zone {}", request.name, request.zone_id);
        let network = self.api.create_network(request).await?;
        tracing::info!("Created network {} (ID: {})", network.name, network.id);
        self.claim(ResourceKind::Network, network).await
    }

    pub async fn firewall_rule(
        &self,
        network_id: &str,
        rule: &FirewallRule,
    ) -> Result<RemoteFirewallRule>
    where
        P: FirewallCapability,
    {
        tracing::info!("Opening firewall rule {} on network {}", rule, network_id);
        let created = self.api.create_firewall_rule(network_id, rule).await?;
        self.claim(ResourceKind::FirewallRule, created).await
    }

    pub async fn public_ip(&self, network_id: &str) -> Result<PublicIp>
    where
        P: PublicIpCapability,
    {
        tracing::info!("Allocating public IP for network {}", network_id);
        let ip = self.api.associate_public_ip(network_id).await?;
        tracing::info!("Allocated public IP {} (ID: {})", ip.address, ip.id);
        self.claim(ResourceKind::PublicIp, ip).await
    }

    pub async fn load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> Result<LoadBalancerRule>
    where
        P: LoadBalancerCapability,
    {
        tracing::info!("Creating load balancer rule {} for {}", request.name, request.key);
        let rule = self.api.create_load_balancer_rule(request).await?;
        tracing::info!("Created load balancer rule {} (ID: {})", rule.name, rule.id);
        self.claim(ResourceKind::LoadBalancerRule, rule).await
    }

    pub async fn affinity_group(&self, spec: &AffinityGroupSpec) -> Result<AffinityGroup>
    where
        P: AffinityGroupCapability,
    {
        tracing::info!(
            "Creating affinity group {} ({})",
            spec.name,
            spec.group_type.as_str()
        );
        let group = self.api.create_affinity_group(spec).await?;
        self.claim(ResourceKind::AffinityGroup, group).await
    }

    pub async fn instance(&self, request: &DeployRequest) -> Result<Instance>
    where
        P: VmCapability,
    {
        tracing::info!("Deploying VM {} in zone {}", request.name, request.zone_id);
        let vm = self.api.deploy_instance(request).await?;
        tracing::info!("Deployed VM {} (ID: {})", vm.name, vm.id);
        self.claim(ResourceKind::Instance, vm).await
    }
}
