//! Per-kind resolution of desired identities against remote state
//!
//! Resolvers are read-only. `Ok(None)` means the remote state definitively
//! holds no match; any lookup failure is an `Err` and must never be read as
//! "not found".

use crate::capability::{
    AffinityGroupCapability, ClusterCapability, FirewallCapability, LoadBalancerCapability,
    NetworkCapability, PublicIpCapability, VmCapability,
};
use crate::error::{CloudError, Result};
use crate::model::{
    AffinityGroup, AffinityGroupSpec, Instance, LoadBalancerKey, LoadBalancerRule, Network,
    NetworkSpec, PublicIp, RemoteFirewallRule, ResourceKind, Resolved, Zone, ZoneRef,
};
use crate::tags::{ForeignMatch, TagManager};

pub struct Resolver<'a, P: ?Sized> {
    api: &'a P,
    tags: &'a TagManager,
}

impl<'a, P: ?Sized> Resolver<'a, P> {
    pub fn new(api: &'a P, tags: &'a TagManager) -> Self {
        Self { api, tags }
    }

    pub async fn zone(&self, zone: &ZoneRef) -> Result<Option<Zone>>
    where
        P: ClusterCapability,
    {
        let zones: Vec<Zone> = self
            .api
            .find_zones(zone)
            .await?
            .into_iter()
            .filter(|z| match zone {
                ZoneRef::Id(id) => &z.id == id,
                ZoneRef::Name(name) => &z.name == name,
            })
            .collect();

        exactly_one(ResourceKind::Zone, &zone.to_string(), zones, |z| z.id.clone())
    }

    pub async fn network(&self, zone_id: &str, spec: &NetworkSpec) -> Result<Option<Resolved<Network>>>
    where
        P: NetworkCapability,
    {
        let candidates: Vec<Network> = self
            .api
            .find_networks(zone_id, spec)
            .await?
            .into_iter()
            .filter(|n| spec.matches(n))
            .collect();

        tracing::debug!(
            "Network {} has {} candidate(s) in zone {}",
            spec.identity(),
            candidates.len(),
            zone_id
        );
        self.tags.select(
            ResourceKind::Network,
            &spec.identity(),
            candidates,
            ForeignMatch::Adopt,
        )
    }

    pub async fn firewall_rules(&self, network_id: &str) -> Result<Vec<RemoteFirewallRule>>
    where
        P: FirewallCapability,
    {
        let rules = self.api.list_firewall_rules(network_id).await?;
        Ok(rules
            .into_iter()
            .filter(|r| r.network_id == network_id)
            .collect())
    }

    /// The public IP holding a pinned address
    pub async fn public_ip_by_address(
        &self,
        zone_id: &str,
        address: &str,
    ) -> Result<Option<Resolved<PublicIp>>>
    where
        P: PublicIpCapability,
    {
        let candidates: Vec<PublicIp> = self
            .api
            .find_public_ips_by_address(zone_id, address)
            .await?
            .into_iter()
            .filter(|ip| ip.address == address)
            .collect();

        self.tags
            .select(ResourceKind::PublicIp, address, candidates, ForeignMatch::Adopt)
    }

    /// The non-source-NAT public IP this cluster holds on a network
    ///
    /// On a network this cluster owns, an unmarked address can only be one
    /// whose tagging failed, so it resolves as `Foreign` for the caller to
    /// claim; several of them are ambiguous. On any other network unmarked
    /// addresses belong to someone else and are skipped.
    pub async fn network_public_ip(
        &self,
        network_id: &str,
        network_owned: bool,
    ) -> Result<Option<Resolved<PublicIp>>>
    where
        P: PublicIpCapability,
    {
        let candidates: Vec<PublicIp> = self
            .api
            .list_network_public_ips(network_id)
            .await?
            .into_iter()
            .filter(|ip| !ip.is_source_nat && ip.network_id.as_deref() == Some(network_id))
            .filter(|ip| TagManager::has_tag(ip, self.tags.owner_tag()) || TagManager::is_unmarked(ip))
            .collect();

        let foreign = if network_owned {
            ForeignMatch::Adopt
        } else {
            ForeignMatch::Ignore
        };
        self.tags.select(
            ResourceKind::PublicIp,
            &format!("network {}", network_id),
            candidates,
            foreign,
        )
    }

    pub async fn load_balancer_rule(
        &self,
        key: &LoadBalancerKey,
    ) -> Result<Option<Resolved<LoadBalancerRule>>>
    where
        P: LoadBalancerCapability,
    {
        let candidates: Vec<LoadBalancerRule> = self
            .api
            .find_load_balancer_rules(key)
            .await?
            .into_iter()
            .filter(|rule| &rule.key() == key)
            .collect();

        self.tags.select(
            ResourceKind::LoadBalancerRule,
            &key.to_string(),
            candidates,
            ForeignMatch::Adopt,
        )
    }

    pub async fn affinity_group(
        &self,
        spec: &AffinityGroupSpec,
    ) -> Result<Option<Resolved<AffinityGroup>>>
    where
        P: AffinityGroupCapability,
    {
        let candidates: Vec<AffinityGroup> = self
            .api
            .find_affinity_groups(&spec.name)
            .await?
            .into_iter()
            .filter(|g| g.name == spec.name && g.group_type == spec.group_type)
            .collect();

        self.tags.select(
            ResourceKind::AffinityGroup,
            &spec.name,
            candidates,
            ForeignMatch::Adopt,
        )
    }

    /// Lookup by name alone, for groups referenced from a machine spec
    pub async fn affinity_group_by_name(&self, name: &str) -> Result<Option<Resolved<AffinityGroup>>>
    where
        P: AffinityGroupCapability,
    {
        let candidates: Vec<AffinityGroup> = self
            .api
            .find_affinity_groups(name)
            .await?
            .into_iter()
            .filter(|g| g.name == name)
            .collect();

        self.tags
            .select(ResourceKind::AffinityGroup, name, candidates, ForeignMatch::Adopt)
    }

    pub async fn instance(&self, zone_id: &str, name: &str) -> Result<Option<Resolved<Instance>>>
    where
        P: VmCapability,
    {
        let candidates: Vec<Instance> = self
            .api
            .find_instances(zone_id, name)
            .await?
            .into_iter()
            .filter(|vm| vm.name == name)
            .collect();

        self.tags
            .select(ResourceKind::Instance, name, candidates, ForeignMatch::Adopt)
    }

    pub async fn service_offering(&self, name: &str) -> Result<String>
    where
        P: VmCapability,
    {
        let ids = self.api.find_service_offerings(name).await?;
        exactly_one(ResourceKind::ServiceOffering, name, ids, Clone::clone)?
            .ok_or_else(|| CloudError::not_found(ResourceKind::ServiceOffering, name))
    }

    pub async fn template(&self, zone_id: &str, name: &str) -> Result<String>
    where
        P: VmCapability,
    {
        let ids = self.api.find_templates(zone_id, name).await?;
        exactly_one(ResourceKind::Template, name, ids, Clone::clone)?
            .ok_or_else(|| CloudError::not_found(ResourceKind::Template, name))
    }
}

/// Untagged lookups: more than one match is always ambiguous
fn exactly_one<T>(
    kind: ResourceKind,
    identity: &str,
    mut matches: Vec<T>,
    id_of: impl Fn(&T) -> String,
) -> Result<Option<T>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches.remove(0))),
        _ => Err(CloudError::Ambiguous {
            kind,
            identity: identity.to_string(),
            candidates: matches.iter().map(id_of).collect(),
        }),
    }
}
