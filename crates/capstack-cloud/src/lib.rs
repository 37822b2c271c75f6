//! capstack reconciliation core
//!
//! Converts a declarative cluster description into remote infrastructure on
//! an IaaS platform, idempotently. Each reconciliation pass re-derives state
//! from the remote API, resolves what already exists, and creates only what
//! is missing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              external control loop              │
//! └─────────────────┬───────────────────────────────┘
//!                   │ Cluster (spec + status)
//! ┌─────────────────▼───────────────────────────────┐
//! │                 capstack-cloud                  │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │ Client: resolve → provision → tag        │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────┐ ┌─────────────┐ ┌────────────┐    │
//! │  │ Resolver │ │ Provisioner │ │ TagManager │    │
//! │  └──────────┘ └─────────────┘ └────────────┘    │
//! │        capability traits (one per kind)         │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │  capstack-cloudstack (signed HTTP + job polls)  │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Ownership is recorded on the remote resources themselves with the tag
//! `capstack-cluster=<namespace>/<name>`; nothing is cached locally.

pub mod capability;
pub mod client;
pub mod error;
pub mod locks;
pub mod model;
pub mod provisioner;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod tags;

#[cfg(test)]
pub(crate) mod fake;

// Re-exports
pub use capability::{
    AffinityGroupCapability, CloudCapabilities, ClusterCapability, FirewallCapability,
    LoadBalancerCapability, NetworkCapability, PublicIpCapability, TagCapability, VmCapability,
};
pub use client::{Client, ClientOptions, DEFAULT_NETWORK_OFFERING};
pub use error::{CloudError, ErrorClass, Result, TransientCause};
pub use model::*;
pub use report::{Action, ActionType, PassReport, PassSummary};
pub use retry::RetryConfig;
pub use tags::{ForeignMatch, OWNER_TAG_KEY, TagManager, TieBreak, ownership_tag};
