//! Apache CloudStack adapter for capstack
//!
//! Implements the `capstack-cloud` capability traits against the CloudStack
//! HTTP API. Requests are signed with the account's secret key and async
//! jobs are polled to completion before a result is handed back.
//!
//! # Example
//!
//! ```ignore
//! use capstack_cloud::{Cluster, ClusterRef};
//!
//! let client = capstack_cloudstack::new_client("/etc/capstack/cloud-config").await?;
//! let mut cluster = Cluster::new(ClusterRef::new("default", "workload"), spec);
//! let report = client.reconcile_cluster(&mut cluster).await?;
//! println!("{}", report.summary());
//! ```

pub mod error;
pub mod gateway;
pub mod provider;
pub mod records;

pub use error::GatewayError;
pub use gateway::{ApiRequest, Gateway, GatewayConfig, HttpGateway};
pub use provider::CloudStackProvider;

use capstack_cloud::{Client, ClientOptions, CloudError};
use capstack_config::Credentials;
use std::path::Path;

/// Reconciliation client over the HTTP gateway
pub type CloudStackClient = Client<CloudStackProvider<HttpGateway>>;

/// Build a client from a credentials file and check that the API answers
///
/// A missing or malformed credentials file fails with
/// [`CloudError::InvalidConfig`] before any network call is made.
pub async fn new_client(path: impl AsRef<Path>) -> capstack_cloud::Result<CloudStackClient> {
    new_client_with_options(path, ClientOptions::default()).await
}

pub async fn new_client_with_options(
    path: impl AsRef<Path>,
    options: ClientOptions,
) -> capstack_cloud::Result<CloudStackClient> {
    let credentials =
        Credentials::load(path.as_ref()).map_err(|e| CloudError::InvalidConfig(e.to_string()))?;
    let gateway = HttpGateway::new(GatewayConfig::from_credentials(&credentials))
        .map_err(|e| CloudError::InvalidConfig(e.to_string()))?;
    connect(gateway, options).await
}

/// Wrap an already-built gateway and probe it
pub async fn connect<G: Gateway>(
    gateway: G,
    options: ClientOptions,
) -> capstack_cloud::Result<Client<CloudStackProvider<G>>> {
    let client = Client::with_options(CloudStackProvider::new(gateway), options);
    client.check_connectivity().await?;
    tracing::info!("Connected to CloudStack API");
    Ok(client)
}
