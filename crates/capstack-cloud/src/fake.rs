//! In-memory cloud used by the orchestrator tests

use crate::capability::{
    AffinityGroupCapability, ClusterCapability, FirewallCapability, LoadBalancerCapability,
    NetworkCapability, PublicIpCapability, TagCapability, VmCapability,
};
use crate::error::{CloudError, Result, TransientCause};
use crate::model::{
    AffinityGroup, AffinityGroupSpec, CreateLoadBalancerRequest, CreateNetworkRequest,
    DeployRequest, FirewallRule, Instance, LoadBalancerKey, LoadBalancerRule, Network,
    NetworkSpec, NetworkType, PublicIp, RemoteFirewallRule, ResourceRef, Tag, Tagged, Zone,
    ZoneRef,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct FakeState {
    pub zones: Vec<Zone>,
    pub networks: Vec<Network>,
    pub firewall_rules: Vec<RemoteFirewallRule>,
    pub public_ips: Vec<PublicIp>,
    pub lb_rules: Vec<LoadBalancerRule>,
    pub lb_members: HashMap<String, Vec<String>>,
    pub affinity_groups: Vec<AffinityGroup>,
    pub instances: Vec<Instance>,
    pub offerings: Vec<(String, String)>,
    pub templates: Vec<(String, String)>,
    pub tags: HashMap<String, Vec<Tag>>,
    pub deploys: Vec<DeployRequest>,

    /// Every mutating call, in order
    pub mutations: Vec<String>,

    /// Remaining `create_tags` calls that fail transiently
    pub tag_failures: u32,

    /// Pretend another process wins every load balancer creation race
    pub lb_conflict_owner: Option<Tag>,

    /// Pretend the address pool is exhausted
    pub ip_pool_exhausted: bool,

    next_id: u32,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> (String, DateTime<Utc>) {
        self.next_id += 1;
        let created = Utc
            .timestamp_opt(1_700_000_000 + i64::from(self.next_id), 0)
            .unwrap();
        (format!("{}-{}", prefix, self.next_id), created)
    }

    fn with_tags<T: Tagged + Clone>(&self, resource: &T) -> T {
        let mut resource = resource.clone();
        *resource.tags_mut() = self.tags.get(resource.id()).cloned().unwrap_or_default();
        resource
    }
}

pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        let state = FakeState {
            zones: vec![Zone {
                id: "zone-1".to_string(),
                name: "zone-a".to_string(),
            }],
            offerings: vec![("off-1".to_string(), "medium".to_string())],
            templates: vec![("tmpl-1".to_string(), "ubuntu-2204-kube".to_string())],
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    pub fn creations(&self) -> usize {
        self.state()
            .mutations
            .iter()
            .filter(|m| m.starts_with("create") || m.starts_with("associate") || m.starts_with("deploy"))
            .count()
    }

    /// Insert a resource as if someone else had created it
    pub fn add_network(&self, id: &str, name: &str, cidr: &str, tags: Vec<Tag>) {
        let mut state = self.state();
        state.tags.insert(id.to_string(), tags);
        state.networks.push(Network {
            id: id.to_string(),
            name: name.to_string(),
            cidr: Some(cidr.to_string()),
            gateway: None,
            network_type: NetworkType::Isolated,
            zone_id: "zone-1".to_string(),
            created: None,
            tags: Vec::new(),
        });
    }

    pub fn add_firewall_rule(&self, id: &str, network_id: &str, rule: FirewallRule, tags: Vec<Tag>) {
        let mut state = self.state();
        state.tags.insert(id.to_string(), tags);
        state.firewall_rules.push(RemoteFirewallRule {
            id: id.to_string(),
            network_id: network_id.to_string(),
            rule,
            created: None,
            tags: Vec::new(),
        });
    }

    pub fn add_public_ip(&self, id: &str, network_id: &str, tags: Vec<Tag>) {
        let mut state = self.state();
        state.tags.insert(id.to_string(), tags);
        let address = format!("198.51.100.{}", state.public_ips.len() + 10);
        state.public_ips.push(PublicIp {
            id: id.to_string(),
            address,
            network_id: Some(network_id.to_string()),
            zone_id: "zone-1".to_string(),
            is_source_nat: false,
            created: None,
            tags: Vec::new(),
        });
    }

    pub fn add_affinity_group(&self, id: &str, spec: &AffinityGroupSpec, tags: Vec<Tag>) {
        let mut state = self.state();
        state.tags.insert(id.to_string(), tags);
        state.affinity_groups.push(AffinityGroup {
            id: id.to_string(),
            name: spec.name.clone(),
            group_type: spec.group_type,
            created: None,
            tags: Vec::new(),
        });
    }

    pub fn add_instance(&self, id: &str, name: &str, tags: Vec<Tag>) {
        let mut state = self.state();
        state.tags.insert(id.to_string(), tags);
        state.instances.push(Instance {
            id: id.to_string(),
            name: name.to_string(),
            state: "Running".to_string(),
            addresses: Vec::new(),
            created: None,
            tags: Vec::new(),
        });
    }
}

fn rejected(operation: &str, target: &str, code: u32, message: &str) -> CloudError {
    CloudError::Rejected {
        operation: operation.to_string(),
        target: target.to_string(),
        code: Some(code),
        message: message.to_string(),
    }
}

#[async_trait]
impl ClusterCapability for FakeCloud {
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn find_zones(&self, zone: &ZoneRef) -> Result<Vec<Zone>> {
        Ok(self
            .state()
            .zones
            .iter()
            .filter(|z| match zone {
                ZoneRef::Id(id) => &z.id == id,
                ZoneRef::Name(name) => &z.name == name,
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NetworkCapability for FakeCloud {
    async fn find_networks(&self, zone_id: &str, spec: &NetworkSpec) -> Result<Vec<Network>> {
        let state = self.state();
        Ok(state
            .networks
            .iter()
            .filter(|n| n.zone_id == zone_id && spec.matches(n))
            .map(|n| state.with_tags(n))
            .collect())
    }

    async fn create_network(&self, request: &CreateNetworkRequest) -> Result<Network> {
        let mut state = self.state();
        let (id, created) = state.next("net");
        let network = Network {
            id: id.clone(),
            name: request.name.clone(),
            cidr: request.cidr.clone().or_else(|| Some("10.1.1.0/24".to_string())),
            gateway: Some("10.1.1.1".to_string()),
            network_type: NetworkType::Isolated,
            zone_id: request.zone_id.clone(),
            created: Some(created),
            tags: Vec::new(),
        };
        state.networks.push(network.clone());
        state.mutations.push(format!("createNetwork {}", id));
        Ok(network)
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.networks.retain(|n| n.id != id);
        state.mutations.push(format!("deleteNetwork {}", id));
        Ok(())
    }
}

#[async_trait]
impl FirewallCapability for FakeCloud {
    async fn list_firewall_rules(&self, network_id: &str) -> Result<Vec<RemoteFirewallRule>> {
        let state = self.state();
        Ok(state
            .firewall_rules
            .iter()
            .filter(|r| r.network_id == network_id)
            .map(|r| state.with_tags(r))
            .collect())
    }

    async fn create_firewall_rule(
        &self,
        network_id: &str,
        rule: &FirewallRule,
    ) -> Result<RemoteFirewallRule> {
        let mut state = self.state();
        let (id, created) = state.next("fw");
        let remote = RemoteFirewallRule {
            id: id.clone(),
            network_id: network_id.to_string(),
            rule: rule.clone(),
            created: Some(created),
            tags: Vec::new(),
        };
        state.firewall_rules.push(remote.clone());
        state.mutations.push(format!("createFirewallRule {}", rule));
        Ok(remote)
    }

    async fn delete_firewall_rule(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        if !state.firewall_rules.iter().any(|r| r.id == id) {
            return Err(rejected("deleteEgressFirewallRule", id, 431, "unable to find rule"));
        }
        state.firewall_rules.retain(|r| r.id != id);
        state.mutations.push(format!("deleteFirewallRule {}", id));
        Ok(())
    }
}

#[async_trait]
impl PublicIpCapability for FakeCloud {
    async fn find_public_ips_by_address(
        &self,
        zone_id: &str,
        address: &str,
    ) -> Result<Vec<PublicIp>> {
        let state = self.state();
        Ok(state
            .public_ips
            .iter()
            .filter(|ip| ip.zone_id == zone_id && ip.address == address)
            .map(|ip| state.with_tags(ip))
            .collect())
    }

    async fn list_network_public_ips(&self, network_id: &str) -> Result<Vec<PublicIp>> {
        let state = self.state();
        Ok(state
            .public_ips
            .iter()
            .filter(|ip| ip.network_id.as_deref() == Some(network_id))
            .map(|ip| state.with_tags(ip))
            .collect())
    }

    async fn associate_public_ip(&self, network_id: &str) -> Result<PublicIp> {
        let mut state = self.state();
        if state.ip_pool_exhausted {
            return Err(rejected(
                "associateIpAddress",
                network_id,
                533,
                "Insufficient address capacity",
            ));
        }
        let (id, created) = state.next("ip");
        let ip = PublicIp {
            id: id.clone(),
            address: format!("203.0.113.{}", state.public_ips.len() + 10),
            network_id: Some(network_id.to_string()),
            zone_id: "zone-1".to_string(),
            is_source_nat: false,
            created: Some(created),
            tags: Vec::new(),
        };
        state.public_ips.push(ip.clone());
        state.mutations.push(format!("associateIpAddress {}", id));
        Ok(ip)
    }

    async fn disassociate_public_ip(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.public_ips.retain(|ip| ip.id != id);
        state.mutations.push(format!("disassociateIpAddress {}", id));
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerCapability for FakeCloud {
    async fn find_load_balancer_rules(
        &self,
        key: &LoadBalancerKey,
    ) -> Result<Vec<LoadBalancerRule>> {
        tokio::task::yield_now().await;
        let state = self.state();
        Ok(state
            .lb_rules
            .iter()
            .filter(|r| &r.key() == key)
            .map(|r| state.with_tags(r))
            .collect())
    }

    async fn create_load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> Result<LoadBalancerRule> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.mutations.push(format!("createLoadBalancerRule {}", request.key));

        if let Some(owner) = state.lb_conflict_owner.take() {
            let (id, created) = state.next("lb");
            state.tags.insert(id.clone(), vec![owner]);
            state.lb_rules.push(LoadBalancerRule {
                id,
                name: request.name.clone(),
                public_ip_id: request.key.public_ip_id.clone(),
                public_port: request.key.public_port,
                private_port: request.private_port,
                protocol: request.key.protocol,
                algorithm: request.algorithm.clone(),
                created: Some(created),
                tags: Vec::new(),
            });
        }

        if state.lb_rules.iter().any(|r| r.key() == request.key) {
            return Err(rejected(
                "createLoadBalancerRule",
                &request.key.to_string(),
                537,
                "There is already a rule for this port",
            ));
        }

        let (id, created) = state.next("lb");
        let rule = LoadBalancerRule {
            id,
            name: request.name.clone(),
            public_ip_id: request.key.public_ip_id.clone(),
            public_port: request.key.public_port,
            private_port: request.private_port,
            protocol: request.key.protocol,
            algorithm: request.algorithm.clone(),
            created: Some(created),
            tags: Vec::new(),
        };
        state.lb_rules.push(rule.clone());
        Ok(rule)
    }

    async fn delete_load_balancer_rule(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.lb_rules.retain(|r| r.id != id);
        state.mutations.push(format!("deleteLoadBalancerRule {}", id));
        Ok(())
    }

    async fn list_load_balancer_instances(&self, rule_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .lb_members
            .get(rule_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn assign_to_load_balancer_rule(
        &self,
        rule_id: &str,
        instance_ids: &[String],
    ) -> Result<()> {
        let mut state = self.state();
        state
            .lb_members
            .entry(rule_id.to_string())
            .or_default()
            .extend(instance_ids.iter().cloned());
        state.mutations.push(format!("assignToLoadBalancerRule {}", rule_id));
        Ok(())
    }
}

#[async_trait]
impl AffinityGroupCapability for FakeCloud {
    async fn find_affinity_groups(&self, name: &str) -> Result<Vec<AffinityGroup>> {
        let state = self.state();
        Ok(state
            .affinity_groups
            .iter()
            .filter(|g| g.name == name)
            .map(|g| state.with_tags(g))
            .collect())
    }

    async fn create_affinity_group(&self, spec: &AffinityGroupSpec) -> Result<AffinityGroup> {
        let mut state = self.state();
        let (id, created) = state.next("ag");
        let group = AffinityGroup {
            id: id.clone(),
            name: spec.name.clone(),
            group_type: spec.group_type,
            created: Some(created),
            tags: Vec::new(),
        };
        state.affinity_groups.push(group.clone());
        state.mutations.push(format!("createAffinityGroup {}", id));
        Ok(group)
    }

    async fn delete_affinity_group(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.affinity_groups.retain(|g| g.id != id);
        state.mutations.push(format!("deleteAffinityGroup {}", id));
        Ok(())
    }
}

#[async_trait]
impl VmCapability for FakeCloud {
    async fn find_instances(&self, _zone_id: &str, name: &str) -> Result<Vec<Instance>> {
        let state = self.state();
        Ok(state
            .instances
            .iter()
            .filter(|vm| vm.name == name)
            .map(|vm| state.with_tags(vm))
            .collect())
    }

    async fn find_service_offerings(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .offerings
            .iter()
            .filter(|(_, n)| n == name)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn find_templates(&self, _zone_id: &str, name: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .templates
            .iter()
            .filter(|(_, n)| n == name)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn deploy_instance(&self, request: &DeployRequest) -> Result<Instance> {
        let mut state = self.state();
        let (id, created) = state.next("vm");
        let vm = Instance {
            id: id.clone(),
            name: request.name.clone(),
            state: "Running".to_string(),
            addresses: vec!["10.1.1.20".to_string()],
            created: Some(created),
            tags: Vec::new(),
        };
        state.instances.push(vm.clone());
        state.deploys.push(request.clone());
        state.mutations.push(format!("deployVirtualMachine {}", id));
        Ok(vm)
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.instances.retain(|vm| vm.id != id);
        state.mutations.push(format!("destroyVirtualMachine {}", id));
        Ok(())
    }
}

#[async_trait]
impl TagCapability for FakeCloud {
    async fn list_tags(&self, resource: &ResourceRef) -> Result<Vec<Tag>> {
        Ok(self
            .state()
            .tags
            .get(&resource.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_tags(&self, resource: &ResourceRef, tags: &[Tag]) -> Result<()> {
        let mut state = self.state();
        if state.tag_failures > 0 {
            state.tag_failures -= 1;
            return Err(CloudError::Transient {
                operation: "createTags".to_string(),
                target: resource.to_string(),
                cause: TransientCause::Connection,
                message: "connection reset by peer".to_string(),
            });
        }
        state
            .tags
            .entry(resource.id.clone())
            .or_default()
            .extend(tags.iter().cloned());
        Ok(())
    }

    async fn delete_tags(&self, resource: &ResourceRef, tags: &[Tag]) -> Result<()> {
        if let Some(current) = self.state().tags.get_mut(&resource.id) {
            current.retain(|t| !tags.contains(t));
        }
        Ok(())
    }
}
