//! Desired and observed resource model
//!
//! Desired specs are owned by the caller and only read here. Observed
//! resources are re-derived from the remote API on every call; the only place
//! results are kept is the caller-owned [`ClusterStatus`], which lives for a
//! single reconciliation pass unless the caller persists it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kinds of remote resources handled by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Zone,
    Network,
    FirewallRule,
    PublicIp,
    LoadBalancerRule,
    AffinityGroup,
    Instance,
    ServiceOffering,
    Template,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Zone => write!(f, "zone"),
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::FirewallRule => write!(f, "firewall rule"),
            ResourceKind::PublicIp => write!(f, "public IP"),
            ResourceKind::LoadBalancerRule => write!(f, "load balancer rule"),
            ResourceKind::AffinityGroup => write!(f, "affinity group"),
            ResourceKind::Instance => write!(f, "VM instance"),
            ResourceKind::ServiceOffering => write!(f, "service offering"),
            ResourceKind::Template => write!(f, "template"),
        }
    }
}

/// Reference to a concrete remote resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// A key/value tag on a remote resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Whether a resolved resource was provisioned by this system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Carries our ownership tag
    Owned,
    /// Pre-existing or externally managed
    Foreign,
}

impl Ownership {
    pub fn is_owned(&self) -> bool {
        matches!(self, Ownership::Owned)
    }
}

/// A resolved resource together with its ownership
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub resource: T,
    pub ownership: Ownership,
}

/// Common accessors used by the tag manager to disambiguate matches
pub trait Tagged {
    fn id(&self) -> &str;
    fn tags(&self) -> &[Tag];
    fn tags_mut(&mut self) -> &mut Vec<Tag>;
    fn created(&self) -> Option<DateTime<Utc>>;
}

macro_rules! impl_tagged {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Tagged for $ty {
                fn id(&self) -> &str {
                    &self.id
                }

                fn tags(&self) -> &[Tag] {
                    &self.tags
                }

                fn tags_mut(&mut self) -> &mut Vec<Tag> {
                    &mut self.tags
                }

                fn created(&self) -> Option<DateTime<Utc>> {
                    self.created
                }
            }
        )*
    };
}

impl_tagged!(
    Network,
    RemoteFirewallRule,
    PublicIp,
    LoadBalancerRule,
    AffinityGroup,
    Instance
);

/// Identity of the cluster object that owns provisioned resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
}

impl ClusterRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ============ Zones ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneRef {
    Id(String),
    Name(String),
}

impl std::fmt::Display for ZoneRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneRef::Id(id) => write!(f, "id={}", id),
            ZoneRef::Name(name) => write!(f, "name={}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

// ============ Networks ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    Isolated,
    Shared,
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkType::Isolated => write!(f, "Isolated"),
            NetworkType::Shared => write!(f, "Shared"),
        }
    }
}

/// Explicit reference to a network that must already exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRef {
    Id(String),
    Name(String),
}

impl std::fmt::Display for NetworkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkRef::Id(id) => write!(f, "id={}", id),
            NetworkRef::Name(name) => write!(f, "name={}", name),
        }
    }
}

/// Desired cluster network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: Option<String>,
    pub network_type: NetworkType,
    /// When set, the network must exist and is never created
    pub existing: Option<NetworkRef>,
}

impl NetworkSpec {
    pub fn isolated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cidr: None,
            network_type: NetworkType::Isolated,
            existing: None,
        }
    }

    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            network_type: NetworkType::Shared,
            ..Self::isolated(name)
        }
    }

    pub fn with_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.cidr = Some(cidr.into());
        self
    }

    pub fn with_existing(mut self, existing: NetworkRef) -> Self {
        self.existing = Some(existing);
        self
    }

    /// Whether an observed network satisfies this spec's identity
    ///
    /// An explicit reference matches on id or name alone; otherwise name,
    /// visibility and (when given) CIDR must all agree.
    pub fn matches(&self, network: &Network) -> bool {
        match &self.existing {
            Some(NetworkRef::Id(id)) => &network.id == id,
            Some(NetworkRef::Name(name)) => &network.name == name,
            None => {
                network.name == self.name
                    && network.network_type == self.network_type
                    && self
                        .cidr
                        .as_ref()
                        .is_none_or(|cidr| network.cidr.as_ref() == Some(cidr))
            }
        }
    }

    /// Isolated networks named by the cluster are created on demand; explicit
    /// references and shared networks never are
    pub fn is_provisionable(&self) -> bool {
        self.existing.is_none() && self.network_type != NetworkType::Shared
    }

    pub fn identity(&self) -> String {
        match &self.existing {
            Some(existing) => existing.to_string(),
            None => match &self.cidr {
                Some(cidr) => format!("{} ({}, {})", self.name, cidr, self.network_type),
                None => format!("{} ({})", self.name, self.network_type),
            },
        }
    }
}

/// Network as observed on the remote platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub cidr: Option<String>,
    pub gateway: Option<String>,
    pub network_type: NetworkType,
    pub zone_id: String,
    pub created: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

/// Request handed to the network capability when provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub zone_id: String,
    pub cidr: Option<String>,
    pub offering: String,
}

/// Network recorded in the cluster status after resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedNetwork {
    pub id: String,
    pub name: String,
    pub cidr: Option<String>,
    pub gateway: Option<String>,
    pub network_type: NetworkType,
    pub ownership: Ownership,
}

impl ResolvedNetwork {
    pub fn from_resolved(resolved: &Resolved<Network>) -> Self {
        let network = &resolved.resource;
        Self {
            id: network.id.clone(),
            name: network.name.clone(),
            cidr: network.cidr.clone(),
            gateway: network.gateway.clone(),
            network_type: network.network_type,
            ownership: resolved.ownership,
        }
    }

    /// True when the network existed before this system touched it
    pub fn is_pre_existing(&self) -> bool {
        !self.ownership.is_owned()
    }
}

// ============ Firewall ============

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(format!("unsupported protocol: {}", other)),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

/// One required firewall rule on the cluster network
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FirewallRule {
    pub protocol: Protocol,
    /// `None` for ICMP
    pub ports: Option<PortRange>,
    pub cidr: String,
}

impl FirewallRule {
    pub fn tcp(port: u16, cidr: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            ports: Some(PortRange::single(port)),
            cidr: cidr.into(),
        }
    }

    pub fn udp(port: u16, cidr: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Udp,
            ports: Some(PortRange::single(port)),
            cidr: cidr.into(),
        }
    }

    pub fn tcp_range(start: u16, end: u16, cidr: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            ports: Some(PortRange { start, end }),
            cidr: cidr.into(),
        }
    }

    pub fn icmp(cidr: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Icmp,
            ports: None,
            cidr: cidr.into(),
        }
    }
}

impl std::fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ports {
            Some(p) if p.start == p.end => write!(f, "{}/{} from {}", self.protocol, p.start, self.cidr),
            Some(p) => write!(f, "{}/{}-{} from {}", self.protocol, p.start, p.end, self.cidr),
            None => write!(f, "{} from {}", self.protocol, self.cidr),
        }
    }
}

/// Firewall rule as observed on a network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFirewallRule {
    pub id: String,
    pub network_id: String,
    pub rule: FirewallRule,
    pub created: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

// ============ Public IPs ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicIp {
    pub id: String,
    pub address: String,
    pub network_id: Option<String>,
    pub zone_id: String,
    pub is_source_nat: bool,
    pub created: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

/// Public IP recorded in the cluster status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIpStatus {
    pub id: String,
    pub address: String,
    pub network_id: String,
    pub ownership: Ownership,
}

// ============ Load balancing ============

/// At most one load balancer rule may exist per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadBalancerKey {
    pub public_ip_id: String,
    pub public_port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for LoadBalancerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.public_ip_id, self.public_port, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerRule {
    pub id: String,
    pub name: String,
    pub public_ip_id: String,
    pub public_port: u16,
    pub private_port: u16,
    pub protocol: Protocol,
    pub algorithm: String,
    pub created: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

impl LoadBalancerRule {
    pub fn key(&self) -> LoadBalancerKey {
        LoadBalancerKey {
            public_ip_id: self.public_ip_id.clone(),
            public_port: self.public_port,
            protocol: self.protocol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub key: LoadBalancerKey,
    pub private_port: u16,
    pub network_id: String,
    pub algorithm: String,
}

// ============ Affinity groups ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityType {
    HostAffinity,
    HostAntiAffinity,
}

impl AffinityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AffinityType::HostAffinity => "host affinity",
            AffinityType::HostAntiAffinity => "host anti-affinity",
        }
    }
}

impl std::str::FromStr for AffinityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "host affinity" => Ok(AffinityType::HostAffinity),
            "host anti-affinity" => Ok(AffinityType::HostAntiAffinity),
            other => Err(format!("unsupported affinity group type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroupSpec {
    pub name: String,
    pub group_type: AffinityType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroup {
    pub id: String,
    pub name: String,
    pub group_type: AffinityType,
    pub created: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

// ============ VM instances ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub offering: String,
    pub template: String,
    #[serde(default)]
    pub affinity_groups: Vec<String>,
    /// Plain-text cloud-init payload
    pub user_data: Option<String>,
    pub ssh_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub state: String,
    pub addresses: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub name: String,
    pub zone_id: String,
    pub offering_id: String,
    pub template_id: String,
    pub network_id: String,
    pub affinity_group_ids: Vec<String>,
    pub user_data: Option<String>,
    pub ssh_key: Option<String>,
}

// ============ Cluster ============

/// Control-plane endpoint; `host` pins a specific public address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub host: Option<String>,
    pub port: u16,
}

impl Default for EndpointSpec {
    fn default() -> Self {
        Self {
            host: None,
            port: 6443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Desired cluster infrastructure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub zone: ZoneRef,
    pub network: NetworkSpec,
    #[serde(default)]
    pub control_plane_endpoint: EndpointSpec,
    #[serde(default)]
    pub firewall_rules: BTreeSet<FirewallRule>,
}

/// Observed cluster infrastructure, filled in as a pass proceeds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub zone_id: Option<String>,
    pub network: Option<ResolvedNetwork>,
    pub public_ip: Option<PublicIpStatus>,
    pub load_balancer_rule_id: Option<String>,
    pub control_plane_endpoint: Option<Endpoint>,
}

/// A cluster object as handed over by the control loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_ref: ClusterRef,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    pub fn new(cluster_ref: ClusterRef, spec: ClusterSpec) -> Self {
        Self {
            cluster_ref,
            spec,
            status: ClusterStatus::default(),
        }
    }
}
