//! Capability traits
//!
//! One trait per resource kind. A backend (the CloudStack adapter, or a fake
//! in tests) implements them; the orchestrator only ever talks to these
//! traits. Every `find_*` call must be scoped by the identity it is given:
//! implementations never fall back to an unfiltered account-wide listing.
//!
//! All errors returned from a capability are already wrapped with the remote
//! operation name and target identity.

use crate::error::Result;
use crate::model::{
    AffinityGroup, AffinityGroupSpec, CreateLoadBalancerRequest, CreateNetworkRequest,
    DeployRequest, FirewallRule, Instance, LoadBalancerKey, LoadBalancerRule, Network,
    NetworkSpec, PublicIp, RemoteFirewallRule, ResourceRef, Tag, Zone, ZoneRef,
};
use async_trait::async_trait;

/// Cluster lifecycle: zones and account liveness
#[async_trait]
pub trait ClusterCapability: Send + Sync {
    /// Lightweight read-only call used as a connectivity probe
    async fn probe(&self) -> Result<()>;

    async fn find_zones(&self, zone: &ZoneRef) -> Result<Vec<Zone>>;
}

#[async_trait]
pub trait NetworkCapability: Send + Sync {
    /// Networks in `zone_id` whose name (or explicit reference) matches `spec`
    async fn find_networks(&self, zone_id: &str, spec: &NetworkSpec) -> Result<Vec<Network>>;

    async fn create_network(&self, request: &CreateNetworkRequest) -> Result<Network>;

    async fn delete_network(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait FirewallCapability: Send + Sync {
    async fn list_firewall_rules(&self, network_id: &str) -> Result<Vec<RemoteFirewallRule>>;

    async fn create_firewall_rule(
        &self,
        network_id: &str,
        rule: &FirewallRule,
    ) -> Result<RemoteFirewallRule>;

    async fn delete_firewall_rule(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait PublicIpCapability: Send + Sync {
    async fn find_public_ips_by_address(
        &self,
        zone_id: &str,
        address: &str,
    ) -> Result<Vec<PublicIp>>;

    /// Non-source-NAT addresses associated with a network
    async fn list_network_public_ips(&self, network_id: &str) -> Result<Vec<PublicIp>>;

    /// Allocate a fresh address from the network's pool
    async fn associate_public_ip(&self, network_id: &str) -> Result<PublicIp>;

    async fn disassociate_public_ip(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait LoadBalancerCapability: Send + Sync {
    async fn find_load_balancer_rules(&self, key: &LoadBalancerKey)
    -> Result<Vec<LoadBalancerRule>>;

    async fn create_load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> Result<LoadBalancerRule>;

    async fn delete_load_balancer_rule(&self, id: &str) -> Result<()>;

    /// Instance ids currently bound to the rule
    async fn list_load_balancer_instances(&self, rule_id: &str) -> Result<Vec<String>>;

    async fn assign_to_load_balancer_rule(
        &self,
        rule_id: &str,
        instance_ids: &[String],
    ) -> Result<()>;
}

#[async_trait]
pub trait AffinityGroupCapability: Send + Sync {
    async fn find_affinity_groups(&self, name: &str) -> Result<Vec<AffinityGroup>>;

    async fn create_affinity_group(&self, spec: &AffinityGroupSpec) -> Result<AffinityGroup>;

    async fn delete_affinity_group(&self, id: &str) -> Result<()>;
}

/// VM lifecycle
#[async_trait]
pub trait VmCapability: Send + Sync {
    async fn find_instances(&self, zone_id: &str, name: &str) -> Result<Vec<Instance>>;

    /// Ids of service offerings with this exact name
    async fn find_service_offerings(&self, name: &str) -> Result<Vec<String>>;

    /// Ids of executable templates with this exact name in the zone
    async fn find_templates(&self, zone_id: &str, name: &str) -> Result<Vec<String>>;

    async fn deploy_instance(&self, request: &DeployRequest) -> Result<Instance>;

    /// Destroy and expunge
    async fn destroy_instance(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait TagCapability: Send + Sync {
    async fn list_tags(&self, resource: &ResourceRef) -> Result<Vec<Tag>>;

    async fn create_tags(&self, resource: &ResourceRef, tags: &[Tag]) -> Result<()>;

    async fn delete_tags(&self, resource: &ResourceRef, tags: &[Tag]) -> Result<()>;
}

/// The full capability set consumed by [`crate::Client`]
pub trait CloudCapabilities:
    ClusterCapability
    + NetworkCapability
    + FirewallCapability
    + PublicIpCapability
    + LoadBalancerCapability
    + AffinityGroupCapability
    + VmCapability
    + TagCapability
{
}

impl<T> CloudCapabilities for T where
    T: ClusterCapability
        + NetworkCapability
        + FirewallCapability
        + PublicIpCapability
        + LoadBalancerCapability
        + AffinityGroupCapability
        + VmCapability
        + TagCapability
{
}
