//! Typed kubeconfig document
//!
//! Only the fields needed to follow `current-context` down to its cluster
//! server are modelled. Everything else is kept in `extra` maps and written
//! back unchanged by [`Kubeconfig::save`].

use crate::error::KubeconfigError;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;

pub type Result<T> = std::result::Result<T, KubeconfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "current-context", default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<Vec<NamedContext>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<Vec<NamedCluster>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterEntry>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn present<'a, T>(value: Option<&'a T>, field: &str) -> Result<&'a T> {
    value.ok_or_else(|| KubeconfigError::FieldMissing(field.to_string()))
}

impl Kubeconfig {
    /// Parse a kubeconfig document
    ///
    /// Malformed YAML is [`KubeconfigError::Parse`]; well-formed YAML whose
    /// fields have the wrong shape is [`KubeconfigError::WrongType`].
    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(content).map_err(KubeconfigError::Parse)?;
        if raw.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(raw).map_err(KubeconfigError::WrongType)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(KubeconfigError::Serialize)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn current_context_name(&self) -> Result<&str> {
        present(self.current_context.as_ref(), "current-context").map(String::as_str)
    }

    pub fn current_context(&self) -> Result<&Context> {
        let name = self.current_context_name()?;
        let entry = present(self.contexts.as_ref(), "contexts")?
            .iter()
            .find(|c| c.name.as_deref() == Some(name))
            .ok_or_else(|| KubeconfigError::EntryNotFound {
                kind: "context",
                name: name.to_string(),
            })?;
        present(entry.context.as_ref(), &format!("contexts[{}].context", name))
    }

    pub fn current_cluster_name(&self) -> Result<&str> {
        let context = self.current_context()?;
        present(context.cluster.as_ref(), "context.cluster").map(String::as_str)
    }

    pub fn current_cluster(&self) -> Result<&ClusterEntry> {
        let index = self.current_cluster_index()?;
        let entry = &present(self.clusters.as_ref(), "clusters")?[index];
        present(entry.cluster.as_ref(), "cluster")
    }

    pub fn current_server(&self) -> Result<&str> {
        present(self.current_cluster()?.server.as_ref(), "cluster.server").map(String::as_str)
    }

    /// Point the current cluster at a new API server URL
    pub fn set_current_server(&mut self, server: impl Into<String>) -> Result<()> {
        let index = self.current_cluster_index()?;
        let clusters = self
            .clusters
            .as_mut()
            .ok_or_else(|| KubeconfigError::FieldMissing("clusters".to_string()))?;
        let entry = clusters[index]
            .cluster
            .as_mut()
            .ok_or_else(|| KubeconfigError::FieldMissing("cluster".to_string()))?;
        entry.server = Some(server.into());
        Ok(())
    }

    fn current_cluster_index(&self) -> Result<usize> {
        let name = self.current_cluster_name()?;
        present(self.clusters.as_ref(), "clusters")?
            .iter()
            .position(|c| c.name.as_deref() == Some(name))
            .ok_or_else(|| KubeconfigError::EntryNotFound {
                kind: "cluster",
                name: name.to_string(),
            })
    }
}
