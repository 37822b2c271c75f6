//! CloudStack wire records and their conversion into the core model

use crate::error::{GatewayError, Result};
use capstack_cloud::{
    AffinityGroup, AffinityType, FirewallRule, Instance, LoadBalancerRule, Network, NetworkType,
    PortRange, Protocol, PublicIp, RemoteFirewallRule, ResourceKind, Tag, Zone,
};
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

/// CloudStack resource type used by the tag API
pub fn resource_type(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Zone => "Zone",
        ResourceKind::Network => "Network",
        ResourceKind::FirewallRule => "FirewallRule",
        ResourceKind::PublicIp => "PublicIpAddress",
        ResourceKind::LoadBalancerRule => "LoadBalancer",
        ResourceKind::AffinityGroup => "AffinityGroup",
        ResourceKind::Instance => "UserVm",
        ResourceKind::ServiceOffering => "ServiceOffering",
        ResourceKind::Template => "Template",
    }
}

/// Items under `key` in a list response; an absent key is an empty list
pub fn list<T: DeserializeOwned>(response: &Value, key: &str) -> Result<Vec<T>> {
    match response.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(items) => Ok(serde_json::from_value(items.clone())?),
    }
}

/// The single object under `key` in a create/job response
pub fn single<T: DeserializeOwned>(response: &Value, key: &str) -> Result<T> {
    let item = response
        .get(key)
        .ok_or_else(|| GatewayError::Decode(format!("response has no '{}' object", key)))?;
    Ok(serde_json::from_value(item.clone())?)
}

fn parse_created(created: Option<&str>) -> Option<DateTime<Utc>> {
    let created = created?;
    match DateTime::parse_from_str(created, "%Y-%m-%dT%H:%M:%S%z") {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::debug!("Unparseable creation time '{}': {}", created, e);
            None
        }
    }
}

/// Numbers are sometimes sent as strings (ports, for one)
fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("port out of range: {}", n))),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid port: {}", s))),
        Some(other) => Err(D::Error::custom(format!("invalid port: {}", other))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRecord {
    pub key: String,
    pub value: String,
}

fn tags(records: Vec<TagRecord>) -> Vec<Tag> {
    records.into_iter().map(|t| Tag::new(t.key, t.value)).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneRecord {
    pub id: String,
    pub name: String,
}

impl From<ZoneRecord> for Zone {
    fn from(r: ZoneRecord) -> Self {
        Zone { id: r.id, name: r.name }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub name: String,
    pub cidr: Option<String>,
    pub gateway: Option<String>,
    #[serde(rename = "type", default)]
    pub network_type: String,
    #[serde(rename = "zoneid", default)]
    pub zone_id: String,
    pub created: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
}

impl From<NetworkRecord> for Network {
    fn from(r: NetworkRecord) -> Self {
        let network_type = if r.network_type.eq_ignore_ascii_case("shared") {
            NetworkType::Shared
        } else {
            NetworkType::Isolated
        };
        Network {
            id: r.id,
            name: r.name,
            cidr: r.cidr,
            gateway: r.gateway,
            network_type,
            zone_id: r.zone_id,
            created: parse_created(r.created.as_deref()),
            tags: tags(r.tags),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallRuleRecord {
    pub id: String,
    #[serde(rename = "networkid", default)]
    pub network_id: String,
    pub protocol: String,
    #[serde(rename = "startport", default, deserialize_with = "number_or_string")]
    pub start_port: Option<u16>,
    #[serde(rename = "endport", default, deserialize_with = "number_or_string")]
    pub end_port: Option<u16>,
    #[serde(rename = "cidrlist", default)]
    pub cidr_list: String,
    pub created: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
}

impl FirewallRuleRecord {
    /// One remote rule per CIDR, so multi-CIDR rules compare like singles
    pub fn into_rules(self) -> Result<Vec<RemoteFirewallRule>> {
        let protocol: Protocol = self
            .protocol
            .parse()
            .map_err(|e: String| GatewayError::Decode(e))?;
        let ports = match (self.start_port, self.end_port) {
            (Some(start), end) => Some(PortRange {
                start,
                end: end.unwrap_or(start),
            }),
            (None, _) => None,
        };
        let created = parse_created(self.created.as_deref());
        let tags = tags(self.tags);

        Ok(self
            .cidr_list
            .split(',')
            .map(str::trim)
            .filter(|cidr| !cidr.is_empty())
            .map(|cidr| RemoteFirewallRule {
                id: self.id.clone(),
                network_id: self.network_id.clone(),
                rule: FirewallRule {
                    protocol,
                    ports,
                    cidr: cidr.to_string(),
                },
                created,
                tags: tags.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicIpRecord {
    pub id: String,
    #[serde(rename = "ipaddress")]
    pub address: String,
    #[serde(rename = "associatednetworkid")]
    pub network_id: Option<String>,
    #[serde(rename = "zoneid", default)]
    pub zone_id: String,
    #[serde(rename = "issourcenat", default)]
    pub is_source_nat: bool,
    pub allocated: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
}

impl From<PublicIpRecord> for PublicIp {
    fn from(r: PublicIpRecord) -> Self {
        PublicIp {
            id: r.id,
            address: r.address,
            network_id: r.network_id,
            zone_id: r.zone_id,
            is_source_nat: r.is_source_nat,
            created: parse_created(r.allocated.as_deref()),
            tags: tags(r.tags),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerRuleRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "publicipid")]
    pub public_ip_id: String,
    #[serde(rename = "publicport", deserialize_with = "number_or_string")]
    pub public_port: Option<u16>,
    #[serde(rename = "privateport", default, deserialize_with = "number_or_string")]
    pub private_port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub algorithm: String,
    pub created: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
}

impl TryFrom<LoadBalancerRuleRecord> for LoadBalancerRule {
    type Error = GatewayError;

    fn try_from(r: LoadBalancerRuleRecord) -> Result<Self> {
        let public_port = r
            .public_port
            .ok_or_else(|| GatewayError::Decode(format!("load balancer rule {} has no public port", r.id)))?;
        // Older releases omit the protocol on TCP rules
        let protocol = match r.protocol.as_deref() {
            None | Some("") => Protocol::Tcp,
            Some(p) => p.parse().map_err(|e: String| GatewayError::Decode(e))?,
        };
        Ok(LoadBalancerRule {
            id: r.id,
            name: r.name,
            public_ip_id: r.public_ip_id,
            public_port,
            private_port: r.private_port.unwrap_or(public_port),
            protocol,
            algorithm: r.algorithm,
            created: parse_created(r.created.as_deref()),
            tags: tags(r.tags),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AffinityGroupRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    pub created: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
}

impl TryFrom<AffinityGroupRecord> for AffinityGroup {
    type Error = GatewayError;

    fn try_from(r: AffinityGroupRecord) -> Result<Self> {
        let group_type: AffinityType = r
            .group_type
            .parse()
            .map_err(|e: String| GatewayError::Decode(e))?;
        Ok(AffinityGroup {
            id: r.id,
            name: r.name,
            group_type,
            created: parse_created(r.created.as_deref()),
            tags: tags(r.tags),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NicRecord {
    #[serde(rename = "ipaddress")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachineRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub nic: Vec<NicRecord>,
    pub created: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
}

impl From<VirtualMachineRecord> for Instance {
    fn from(r: VirtualMachineRecord) -> Self {
        Instance {
            id: r.id,
            name: r.name,
            state: r.state,
            addresses: r.nic.into_iter().filter_map(|n| n.address).collect(),
            created: parse_created(r.created.as_deref()),
            tags: tags(r.tags),
        }
    }
}
