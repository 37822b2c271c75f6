//! CloudStack implementation of the capability traits

use crate::gateway::{ApiRequest, Gateway};
use crate::records::{
    self, AffinityGroupRecord, FirewallRuleRecord, IdRecord, LoadBalancerRuleRecord,
    NetworkRecord, PublicIpRecord, TagRecord, VirtualMachineRecord, ZoneRecord,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use capstack_cloud::{
    AffinityGroup, AffinityGroupCapability, AffinityGroupSpec, CloudError, ClusterCapability,
    CreateLoadBalancerRequest, CreateNetworkRequest, DeployRequest, FirewallCapability,
    FirewallRule, Instance, LoadBalancerCapability, LoadBalancerKey, LoadBalancerRule, Network,
    NetworkCapability, NetworkRef, NetworkSpec, NetworkType, PublicIp, PublicIpCapability,
    RemoteFirewallRule, ResourceRef, Result, Tag, TagCapability, VmCapability, Zone, ZoneRef,
};
use serde_json::Value;
use std::net::Ipv4Addr;

pub struct CloudStackProvider<G: Gateway> {
    gateway: G,
}

impl<G: Gateway> CloudStackProvider<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    async fn call(&self, request: ApiRequest, target: &str) -> Result<Value> {
        let operation = request.command().to_string();
        self.gateway
            .invoke(request)
            .await
            .map_err(|e| e.context(&operation, target))
    }

    async fn list<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
        key: &str,
        target: &str,
    ) -> Result<Vec<T>> {
        let operation = request.command().to_string();
        let response = self.call(request, target).await?;
        records::list(&response, key).map_err(|e| e.context(&operation, target))
    }

    async fn create<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
        key: &str,
        target: &str,
    ) -> Result<T> {
        let operation = request.command().to_string();
        let response = self.call(request, target).await?;
        records::single(&response, key).map_err(|e| e.context(&operation, target))
    }

    async fn network_offering_id(&self, name: &str) -> Result<String> {
        let offerings: Vec<IdRecord> = self
            .list(
                ApiRequest::new("listNetworkOfferings").param("name", name),
                "networkoffering",
                name,
            )
            .await?;
        offerings
            .into_iter()
            .find(|o| o.name == name)
            .map(|o| o.id)
            .ok_or_else(|| CloudError::InvalidConfig(format!("network offering '{}' not found", name)))
    }
}

/// Gateway and netmask for an IPv4 CIDR; the gateway is the first host address
fn gateway_and_netmask(cidr: &str) -> Result<(String, String)> {
    let invalid = || CloudError::InvalidConfig(format!("invalid IPv4 CIDR '{}'", cidr));
    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if !(1..=30).contains(&prefix) {
        return Err(invalid());
    }

    let mask = u32::MAX << (32 - prefix);
    let network = u32::from(address) & mask;
    Ok((
        Ipv4Addr::from(network + 1).to_string(),
        Ipv4Addr::from(mask).to_string(),
    ))
}

#[async_trait]
impl<G: Gateway> ClusterCapability for CloudStackProvider<G> {
    async fn probe(&self) -> Result<()> {
        self.call(ApiRequest::new("listZones").param("available", true), "zones")
            .await
            .map(|_| ())
    }

    async fn find_zones(&self, zone: &ZoneRef) -> Result<Vec<Zone>> {
        let request = match zone {
            ZoneRef::Id(id) => ApiRequest::new("listZones").param("id", id),
            ZoneRef::Name(name) => ApiRequest::new("listZones").param("name", name),
        };
        let zones: Vec<ZoneRecord> = self.list(request, "zone", &zone.to_string()).await?;
        Ok(zones.into_iter().map(Zone::from).collect())
    }
}

#[async_trait]
impl<G: Gateway> NetworkCapability for CloudStackProvider<G> {
    async fn find_networks(&self, zone_id: &str, spec: &NetworkSpec) -> Result<Vec<Network>> {
        let request = ApiRequest::new("listNetworks")
            .param("zoneid", zone_id)
            .param("listall", true);
        let request = match &spec.existing {
            Some(NetworkRef::Id(id)) => request.param("id", id),
            Some(NetworkRef::Name(name)) => request.param("keyword", name),
            None => request.param("keyword", &spec.name).param(
                "type",
                match spec.network_type {
                    NetworkType::Isolated => "Isolated",
                    NetworkType::Shared => "Shared",
                },
            ),
        };

        let networks: Vec<NetworkRecord> = self.list(request, "network", &spec.identity()).await?;
        Ok(networks.into_iter().map(Network::from).collect())
    }

    async fn create_network(&self, request: &CreateNetworkRequest) -> Result<Network> {
        let offering_id = self.network_offering_id(&request.offering).await?;
        let mut api = ApiRequest::new("createNetwork")
            .param("name", &request.name)
            .param("displaytext", &request.name)
            .param("zoneid", &request.zone_id)
            .param("networkofferingid", offering_id);
        if let Some(cidr) = &request.cidr {
            let (gateway, netmask) = gateway_and_netmask(cidr)?;
            api = api.param("gateway", gateway).param("netmask", netmask);
        }

        let record: NetworkRecord = self.create(api, "network", &request.name).await?;
        Ok(record.into())
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        self.call(ApiRequest::new("deleteNetwork").param("id", id), id)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<G: Gateway> FirewallCapability for CloudStackProvider<G> {
    async fn list_firewall_rules(&self, network_id: &str) -> Result<Vec<RemoteFirewallRule>> {
        let request = ApiRequest::new("listEgressFirewallRules")
            .param("networkid", network_id)
            .param("listall", true);
        let records: Vec<FirewallRuleRecord> =
            self.list(request, "firewallrule", network_id).await?;

        // Rules with a protocol the model has no variant for ("all", numbered
        // protocols) can never satisfy a required rule and are left out
        let mut rules = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            match record.into_rules() {
                Ok(converted) => rules.extend(converted),
                Err(e) => {
                    tracing::debug!("Skipping egress rule {} on network {}: {}", id, network_id, e)
                }
            }
        }
        Ok(rules)
    }

    async fn create_firewall_rule(
        &self,
        network_id: &str,
        rule: &FirewallRule,
    ) -> Result<RemoteFirewallRule> {
        let request = ApiRequest::new("createEgressFirewallRule")
            .param("networkid", network_id)
            .param("protocol", rule.protocol)
            .param("cidrlist", &rule.cidr)
            .opt_param("startport", rule.ports.map(|p| p.start))
            .opt_param("endport", rule.ports.map(|p| p.end));

        let target = rule.to_string();
        let record: FirewallRuleRecord = self.create(request, "firewallrule", &target).await?;
        let id = record.id.clone();
        let mut remote = record
            .into_rules()
            .map_err(|e| e.context("createEgressFirewallRule", &target))?;

        match remote.iter().position(|r| &r.rule == rule) {
            Some(index) => Ok(remote.swap_remove(index)),
            None => Err(CloudError::PartialProvisioning {
                kind: capstack_cloud::ResourceKind::FirewallRule,
                id,
                step: "verification".to_string(),
                message: format!("created rule does not match {}", target),
            }),
        }
    }

    async fn delete_firewall_rule(&self, id: &str) -> Result<()> {
        self.call(ApiRequest::new("deleteEgressFirewallRule").param("id", id), id)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<G: Gateway> PublicIpCapability for CloudStackProvider<G> {
    async fn find_public_ips_by_address(
        &self,
        zone_id: &str,
        address: &str,
    ) -> Result<Vec<PublicIp>> {
        let request = ApiRequest::new("listPublicIpAddresses")
            .param("zoneid", zone_id)
            .param("ipaddress", address)
            .param("listall", true);
        let ips: Vec<PublicIpRecord> = self.list(request, "publicipaddress", address).await?;
        Ok(ips.into_iter().map(PublicIp::from).collect())
    }

    async fn list_network_public_ips(&self, network_id: &str) -> Result<Vec<PublicIp>> {
        let request = ApiRequest::new("listPublicIpAddresses")
            .param("associatednetworkid", network_id)
            .param("allocatedonly", true)
            .param("listall", true);
        let ips: Vec<PublicIpRecord> = self.list(request, "publicipaddress", network_id).await?;
        Ok(ips.into_iter().map(PublicIp::from).collect())
    }

    async fn associate_public_ip(&self, network_id: &str) -> Result<PublicIp> {
        let request = ApiRequest::new("associateIpAddress").param("networkid", network_id);
        let record: PublicIpRecord = self.create(request, "ipaddress", network_id).await?;
        Ok(record.into())
    }

    async fn disassociate_public_ip(&self, id: &str) -> Result<()> {
        self.call(ApiRequest::new("disassociateIpAddress").param("id", id), id)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<G: Gateway> LoadBalancerCapability for CloudStackProvider<G> {
    async fn find_load_balancer_rules(
        &self,
        key: &LoadBalancerKey,
    ) -> Result<Vec<LoadBalancerRule>> {
        let target = key.to_string();
        let request = ApiRequest::new("listLoadBalancerRules")
            .param("publicipid", &key.public_ip_id)
            .param("listall", true);
        let records: Vec<LoadBalancerRuleRecord> =
            self.list(request, "loadbalancerrule", &target).await?;

        records
            .into_iter()
            .map(|r| LoadBalancerRule::try_from(r).map_err(|e| e.context("listLoadBalancerRules", &target)))
            .collect()
    }

    async fn create_load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> Result<LoadBalancerRule> {
        let target = request.key.to_string();
        let api = ApiRequest::new("createLoadBalancerRule")
            .param("name", &request.name)
            .param("publicipid", &request.key.public_ip_id)
            .param("publicport", request.key.public_port)
            .param("privateport", request.private_port)
            .param("protocol", request.key.protocol)
            .param("networkid", &request.network_id)
            .param("algorithm", &request.algorithm)
            .param("openfirewall", false);

        let record: LoadBalancerRuleRecord = self.create(api, "loadbalancer", &target).await?;
        LoadBalancerRule::try_from(record).map_err(|e| e.context("createLoadBalancerRule", &target))
    }

    async fn delete_load_balancer_rule(&self, id: &str) -> Result<()> {
        self.call(ApiRequest::new("deleteLoadBalancerRule").param("id", id), id)
            .await
            .map(|_| ())
    }

    async fn list_load_balancer_instances(&self, rule_id: &str) -> Result<Vec<String>> {
        let request = ApiRequest::new("listLoadBalancerRuleInstances")
            .param("id", rule_id)
            .param("listall", true);
        let members: Vec<IdRecord> = self
            .list(request, "loadbalancerruleinstance", rule_id)
            .await?;
        Ok(members.into_iter().map(|m| m.id).collect())
    }

    async fn assign_to_load_balancer_rule(
        &self,
        rule_id: &str,
        instance_ids: &[String],
    ) -> Result<()> {
        let request = ApiRequest::new("assignToLoadBalancerRule")
            .param("id", rule_id)
            .param("virtualmachineids", instance_ids.join(","));
        self.call(request, rule_id).await.map(|_| ())
    }
}

#[async_trait]
impl<G: Gateway> AffinityGroupCapability for CloudStackProvider<G> {
    async fn find_affinity_groups(&self, name: &str) -> Result<Vec<AffinityGroup>> {
        let request = ApiRequest::new("listAffinityGroups")
            .param("name", name)
            .param("listall", true);
        let records: Vec<AffinityGroupRecord> = self.list(request, "affinitygroup", name).await?;

        records
            .into_iter()
            .map(|r| AffinityGroup::try_from(r).map_err(|e| e.context("listAffinityGroups", name)))
            .collect()
    }

    async fn create_affinity_group(&self, spec: &AffinityGroupSpec) -> Result<AffinityGroup> {
        let request = ApiRequest::new("createAffinityGroup")
            .param("name", &spec.name)
            .param("type", spec.group_type.as_str());
        let record: AffinityGroupRecord = self.create(request, "affinitygroup", &spec.name).await?;
        AffinityGroup::try_from(record).map_err(|e| e.context("createAffinityGroup", &spec.name))
    }

    async fn delete_affinity_group(&self, id: &str) -> Result<()> {
        self.call(ApiRequest::new("deleteAffinityGroup").param("id", id), id)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<G: Gateway> VmCapability for CloudStackProvider<G> {
    async fn find_instances(&self, zone_id: &str, name: &str) -> Result<Vec<Instance>> {
        let request = ApiRequest::new("listVirtualMachines")
            .param("zoneid", zone_id)
            .param("name", name)
            .param("listall", true);
        let records: Vec<VirtualMachineRecord> =
            self.list(request, "virtualmachine", name).await?;
        Ok(records.into_iter().map(Instance::from).collect())
    }

    async fn find_service_offerings(&self, name: &str) -> Result<Vec<String>> {
        let offerings: Vec<IdRecord> = self
            .list(
                ApiRequest::new("listServiceOfferings").param("name", name),
                "serviceoffering",
                name,
            )
            .await?;
        Ok(offerings
            .into_iter()
            .filter(|o| o.name == name)
            .map(|o| o.id)
            .collect())
    }

    async fn find_templates(&self, zone_id: &str, name: &str) -> Result<Vec<String>> {
        let request = ApiRequest::new("listTemplates")
            .param("templatefilter", "executable")
            .param("zoneid", zone_id)
            .param("name", name);
        let templates: Vec<IdRecord> = self.list(request, "template", name).await?;

        let mut ids: Vec<String> = templates
            .into_iter()
            .filter(|t| t.name == name)
            .map(|t| t.id)
            .collect();
        // One template is listed once per zone it is available in
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn deploy_instance(&self, request: &DeployRequest) -> Result<Instance> {
        let affinity_group_ids =
            (!request.affinity_group_ids.is_empty()).then(|| request.affinity_group_ids.join(","));
        let api = ApiRequest::new("deployVirtualMachine")
            .param("name", &request.name)
            .param("displayname", &request.name)
            .param("zoneid", &request.zone_id)
            .param("serviceofferingid", &request.offering_id)
            .param("templateid", &request.template_id)
            .param("networkids", &request.network_id)
            .opt_param("affinitygroupids", affinity_group_ids)
            .opt_param("userdata", request.user_data.as_ref().map(|d| BASE64.encode(d)))
            .opt_param("keypair", request.ssh_key.as_ref());

        let record: VirtualMachineRecord =
            self.create(api, "virtualmachine", &request.name).await?;
        Ok(record.into())
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        let request = ApiRequest::new("destroyVirtualMachine")
            .param("id", id)
            .param("expunge", true);
        self.call(request, id).await.map(|_| ())
    }
}

#[async_trait]
impl<G: Gateway> TagCapability for CloudStackProvider<G> {
    async fn list_tags(&self, resource: &ResourceRef) -> Result<Vec<Tag>> {
        let request = ApiRequest::new("listTags")
            .param("resourceid", &resource.id)
            .param("resourcetype", records::resource_type(resource.kind))
            .param("listall", true);
        let tags: Vec<TagRecord> = self.list(request, "tag", &resource.to_string()).await?;
        Ok(tags.into_iter().map(|t| Tag::new(t.key, t.value)).collect())
    }

    async fn create_tags(&self, resource: &ResourceRef, tags: &[Tag]) -> Result<()> {
        let entries: Vec<(&str, &str)> = tags
            .iter()
            .map(|t| (t.key.as_str(), t.value.as_str()))
            .collect();
        let request = ApiRequest::new("createTags")
            .param("resourceids", &resource.id)
            .param("resourcetype", records::resource_type(resource.kind))
            .map_param("tags", &entries);
        self.call(request, &resource.to_string()).await.map(|_| ())
    }

    async fn delete_tags(&self, resource: &ResourceRef, tags: &[Tag]) -> Result<()> {
        let entries: Vec<(&str, &str)> = tags
            .iter()
            .map(|t| (t.key.as_str(), t.value.as_str()))
            .collect();
        let request = ApiRequest::new("deleteTags")
            .param("resourceids", &resource.id)
            .param("resourcetype", records::resource_type(resource.kind))
            .map_param("tags", &entries);
        self.call(request, &resource.to_string()).await.map(|_| ())
    }
}
