use async_trait::async_trait;
use capstack_cloud::{Cluster, ClusterRef, ClusterSpec, EndpointSpec, FirewallRule, NetworkSpec, ZoneRef};
use capstack_cloudstack::error::Result;
use capstack_cloudstack::{ApiRequest, Gateway, GatewayError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const ZONE_ID: &str = "zone-1";
pub const ZONE_NAME: &str = "zone-a";
pub const OWNER_VALUE: &str = "default/workload";
const CREATED: &str = "2026-01-01T00:00:00+0000";

/// In-memory CloudStack answering the commands the provider issues
#[derive(Default)]
pub struct FakeState {
    pub calls: Vec<String>,
    pub networks: Vec<Value>,
    pub firewall_rules: Vec<Value>,
    pub public_ips: Vec<Value>,
    pub lb_rules: Vec<Value>,
    pub lb_members: HashMap<String, Vec<String>>,
    pub tags: HashMap<String, Vec<(String, String)>>,

    /// Remaining `createTags` calls that fail with a connection error
    pub tag_failures: u32,

    next_id: u32,
}

#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<FakeState>>,
}

#[allow(dead_code)]
impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self, command: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == command).count()
    }

    pub fn seed_network(&self, id: &str, name: &str) {
        self.state().networks.push(json!({
            "id": id,
            "name": name,
            "cidr": "10.1.1.0/24",
            "gateway": "10.1.1.1",
            "type": "Isolated",
            "zoneid": ZONE_ID,
            "created": CREATED,
        }));
    }

    /// Seed an egress rule; `cidrs` is the raw comma-separated list
    pub fn seed_firewall_rule(
        &self,
        network_id: &str,
        protocol: &str,
        port: Option<u16>,
        cidrs: &str,
    ) -> String {
        let mut state = self.state();
        let id = state.next_id("fw");
        let mut rule = json!({
            "id": id,
            "networkid": network_id,
            "protocol": protocol,
            "cidrlist": cidrs,
        });
        if let Some(port) = port {
            rule["startport"] = json!(port);
            rule["endport"] = json!(port);
        }
        state.firewall_rules.push(rule);
        id
    }

    pub fn tag(&self, resource_id: &str, key: &str, value: &str) {
        self.state()
            .tags
            .entry(resource_id.to_string())
            .or_default()
            .push((key.to_string(), value.to_string()));
    }
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn tagged<'a>(&self, items: impl Iterator<Item = &'a Value>) -> Vec<Value> {
        items
            .map(|item| {
                let mut item = item.clone();
                let id = item["id"].as_str().unwrap_or_default().to_string();
                let tags: Vec<Value> = self
                    .tags
                    .get(&id)
                    .into_iter()
                    .flatten()
                    .map(|(k, v)| json!({"key": k, "value": v}))
                    .collect();
                item["tags"] = Value::Array(tags);
                item
            })
            .collect()
    }

    fn handle(&mut self, req: &ApiRequest) -> Result<Value> {
        match req.command() {
            "listZones" => {
                let hit = field_eq(&json!({"id": ZONE_ID}), "id", req.get("id"))
                    && req.get("name").is_none_or(|n| n == ZONE_NAME);
                let zones: Vec<Value> = if hit {
                    vec![json!({"id": ZONE_ID, "name": ZONE_NAME})]
                } else {
                    Vec::new()
                };
                Ok(json!({ "zone": zones }))
            }
            "listNetworkOfferings" => Ok(json!({
                "networkoffering": [{"id": "offering-1", "name": req.get("name")}]
            })),
            "listNetworks" => {
                let items = self.networks.iter().filter(|n| {
                    field_eq(n, "id", req.get("id"))
                        && field_eq(n, "zoneid", req.get("zoneid"))
                        && req
                            .get("keyword")
                            .is_none_or(|k| n["name"].as_str().is_some_and(|name| name.contains(k)))
                });
                Ok(json!({ "network": self.tagged(items) }))
            }
            "createNetwork" => {
                let id = self.next_id("net");
                let gateway = req.get("gateway").unwrap_or("10.1.1.1");
                let prefix = gateway.rsplit_once('.').map(|(p, _)| p).unwrap_or("10.1.1");
                let network = json!({
                    "id": id,
                    "name": req.get("name"),
                    "cidr": format!("{}.0/24", prefix),
                    "gateway": gateway,
                    "type": "Isolated",
                    "zoneid": req.get("zoneid"),
                    "created": CREATED,
                });
                self.networks.push(network.clone());
                Ok(json!({ "network": network }))
            }
            "deleteNetwork" => {
                let id = req.get("id").unwrap_or_default();
                remove_by_id(&mut self.networks, id)?;
                self.firewall_rules.retain(|r| !field_eq(r, "networkid", Some(id)));
                Ok(json!({ "success": true }))
            }
            "listEgressFirewallRules" => {
                let items = self
                    .firewall_rules
                    .iter()
                    .filter(|r| field_eq(r, "networkid", req.get("networkid")));
                Ok(json!({ "firewallrule": self.tagged(items) }))
            }
            "createEgressFirewallRule" => {
                let rule = json!({
                    "id": self.next_id("fw"),
                    "networkid": req.get("networkid"),
                    "protocol": req.get("protocol"),
                    "startport": req.get("startport"),
                    "endport": req.get("endport"),
                    "cidrlist": req.get("cidrlist"),
                    "created": CREATED,
                });
                self.firewall_rules.push(rule.clone());
                Ok(json!({ "firewallrule": rule }))
            }
            "deleteEgressFirewallRule" => {
                let id = req.get("id").unwrap_or_default();
                remove_by_id(&mut self.firewall_rules, id)
            }
            "listPublicIpAddresses" => {
                let items = self.public_ips.iter().filter(|ip| {
                    field_eq(ip, "ipaddress", req.get("ipaddress"))
                        && field_eq(ip, "associatednetworkid", req.get("associatednetworkid"))
                });
                Ok(json!({ "publicipaddress": self.tagged(items) }))
            }
            "associateIpAddress" => {
                let id = self.next_id("ip");
                let ip = json!({
                    "id": id,
                    "ipaddress": format!("203.0.113.{}", self.next_id),
                    "associatednetworkid": req.get("networkid"),
                    "zoneid": ZONE_ID,
                    "issourcenat": false,
                    "allocated": CREATED,
                });
                self.public_ips.push(ip.clone());
                Ok(json!({ "ipaddress": ip }))
            }
            "disassociateIpAddress" => {
                let id = req.get("id").unwrap_or_default();
                remove_by_id(&mut self.public_ips, id)
            }
            "listLoadBalancerRules" => {
                let items = self
                    .lb_rules
                    .iter()
                    .filter(|r| field_eq(r, "publicipid", req.get("publicipid")));
                Ok(json!({ "loadbalancerrule": self.tagged(items) }))
            }
            "createLoadBalancerRule" => {
                let conflict = self.lb_rules.iter().any(|r| {
                    field_eq(r, "publicipid", req.get("publicipid"))
                        && field_eq(r, "publicport", req.get("publicport"))
                });
                if conflict {
                    return Err(GatewayError::Api {
                        code: 537,
                        message: "a rule for this port already exists".to_string(),
                    });
                }
                let rule = json!({
                    "id": self.next_id("lb"),
                    "name": req.get("name"),
                    "publicipid": req.get("publicipid"),
                    "publicport": req.get("publicport"),
                    "privateport": req.get("privateport"),
                    "protocol": req.get("protocol"),
                    "algorithm": req.get("algorithm"),
                    "created": CREATED,
                });
                self.lb_rules.push(rule.clone());
                Ok(json!({ "loadbalancer": rule }))
            }
            "deleteLoadBalancerRule" => {
                let id = req.get("id").unwrap_or_default();
                remove_by_id(&mut self.lb_rules, id)
            }
            "listLoadBalancerRuleInstances" => {
                let members: Vec<Value> = req
                    .get("id")
                    .and_then(|id| self.lb_members.get(id))
                    .into_iter()
                    .flatten()
                    .map(|id| json!({"id": id}))
                    .collect();
                Ok(json!({ "loadbalancerruleinstance": members }))
            }
            "assignToLoadBalancerRule" => {
                let rule_id = req.get("id").unwrap_or_default().to_string();
                let members = self.lb_members.entry(rule_id).or_default();
                for vm in req.get("virtualmachineids").unwrap_or_default().split(',') {
                    members.push(vm.to_string());
                }
                Ok(json!({ "success": true }))
            }
            "listTags" => {
                let tags: Vec<Value> = req
                    .get("resourceid")
                    .and_then(|id| self.tags.get(id))
                    .into_iter()
                    .flatten()
                    .map(|(k, v)| json!({"key": k, "value": v}))
                    .collect();
                Ok(json!({ "tag": tags }))
            }
            "createTags" => {
                if self.tag_failures > 0 {
                    self.tag_failures -= 1;
                    return Err(GatewayError::Connection("connection reset by peer".to_string()));
                }
                let resource = req.get("resourceids").unwrap_or_default().to_string();
                let key = req.get("tags[0].key").unwrap_or_default().to_string();
                let value = req.get("tags[0].value").unwrap_or_default().to_string();
                self.tags.entry(resource).or_default().push((key, value));
                Ok(json!({ "success": true }))
            }
            other => Err(GatewayError::Api {
                code: 431,
                message: format!("unsupported command {}", other),
            }),
        }
    }
}

/// CloudStack rejects deleting an id it no longer knows
fn remove_by_id(items: &mut Vec<Value>, id: &str) -> Result<Value> {
    let before = items.len();
    items.retain(|item| !field_eq(item, "id", Some(id)));
    if items.len() == before {
        return Err(GatewayError::Api {
            code: 431,
            message: format!("unable to find resource {}", id),
        });
    }
    Ok(json!({ "success": true }))
}

fn field_eq(item: &Value, field: &str, wanted: Option<&str>) -> bool {
    wanted.is_none_or(|wanted| match &item[field] {
        Value::String(s) => s == wanted,
        Value::Number(n) => n.to_string() == wanted,
        _ => false,
    })
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn invoke(&self, request: ApiRequest) -> Result<Value> {
        // Let concurrent callers interleave between calls
        tokio::time::sleep(Duration::from_millis(2)).await;
        let mut state = self.state();
        state.calls.push(request.command().to_string());
        state.handle(&request)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn cluster() -> Cluster {
    let spec = ClusterSpec {
        zone: ZoneRef::Name(ZONE_NAME.to_string()),
        network: NetworkSpec::isolated("workload-net").with_cidr("10.1.1.0/24"),
        control_plane_endpoint: EndpointSpec::default(),
        firewall_rules: [
            FirewallRule::tcp(22, "0.0.0.0/0"),
            FirewallRule::tcp(6443, "0.0.0.0/0"),
        ]
        .into_iter()
        .collect(),
    };
    Cluster::new(ClusterRef::new("default", "workload"), spec)
}
