//! Ownership tagging
//!
//! The remote API has no notion of ownership, so a single tag
//! (`capstack-cluster=<namespace>/<name>`) is the only way to recognise
//! resources provisioned for a cluster across reconciliation passes. All
//! disambiguation of multiple matches goes through [`TagManager::select`].

use crate::capability::TagCapability;
use crate::error::{CloudError, Result};
use crate::model::{ClusterRef, Ownership, ResourceKind, ResourceRef, Resolved, Tag, Tagged};
use crate::retry::{RetryConfig, retry_with_backoff_if};

/// Tag key marking resources owned by a cluster
pub const OWNER_TAG_KEY: &str = "capstack-cluster";

/// Ownership tag for a cluster object
pub fn ownership_tag(cluster: &ClusterRef) -> Tag {
    Tag::new(OWNER_TAG_KEY, cluster.to_string())
}

/// Policy applied when several owned resources match one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Pick the strictly most recently created match; ties are ambiguous
    #[default]
    MostRecent,
    /// Any second owned match is ambiguous
    Strict,
}

/// How untagged matches are treated during resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignMatch {
    /// A single foreign match is returned as `Foreign`; callers may claim an unmarked one
    Adopt,
    /// Untagged matches belong to someone else and are skipped
    Ignore,
}

/// Maintains and interprets the ownership tag for one cluster
#[derive(Debug, Clone)]
pub struct TagManager {
    owner: Tag,
    retry: RetryConfig,
    tie_break: TieBreak,
}

impl TagManager {
    pub fn new(owner: Tag) -> Self {
        Self {
            owner,
            retry: RetryConfig::default(),
            tie_break: TieBreak::default(),
        }
    }

    pub fn for_cluster(cluster: &ClusterRef) -> Self {
        Self::new(ownership_tag(cluster))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn owner_tag(&self) -> &Tag {
        &self.owner
    }

    pub fn has_tag<T: Tagged + ?Sized>(resource: &T, tag: &Tag) -> bool {
        resource.tags().iter().any(|t| t == tag)
    }

    pub fn ownership_of<T: Tagged + ?Sized>(&self, resource: &T) -> Ownership {
        if Self::has_tag(resource, &self.owner) {
            Ownership::Owned
        } else {
            Ownership::Foreign
        }
    }

    /// Make sure `tag` is present on `resource`; no-op when it already is
    pub async fn ensure_tag<A: TagCapability + ?Sized>(
        &self,
        api: &A,
        resource: &ResourceRef,
        tag: &Tag,
    ) -> Result<()> {
        let current = api.list_tags(resource).await?;

        if current.iter().any(|t| t == tag) {
            tracing::debug!("{} already tagged {}={}", resource, tag.key, tag.value);
            return Ok(());
        }

        if let Some(conflict) = current.iter().find(|t| t.key == tag.key) {
            return Err(CloudError::precondition(
                "ensure_tag",
                format!(
                    "{} already carries {}={}, refusing to claim it for {}",
                    resource, conflict.key, conflict.value, tag.value
                ),
            ));
        }

        api.create_tags(resource, std::slice::from_ref(tag)).await?;
        tracing::debug!("Tagged {} with {}={}", resource, tag.key, tag.value);
        Ok(())
    }

    pub async fn remove_tag<A: TagCapability + ?Sized>(
        &self,
        api: &A,
        resource: &ResourceRef,
        tag: &Tag,
    ) -> Result<()> {
        let current = api.list_tags(resource).await?;
        if !current.iter().any(|t| t == tag) {
            return Ok(());
        }
        api.delete_tags(resource, std::slice::from_ref(tag)).await
    }

    /// No ownership tag at all, neither ours nor another cluster's
    pub fn is_unmarked<T: Tagged + ?Sized>(resource: &T) -> bool {
        !resource.tags().iter().any(|t| t.key == OWNER_TAG_KEY)
    }

    /// Apply the ownership tag to a freshly created resource
    ///
    /// Only transient failures are retried. When tagging fails the resource
    /// exists untagged, which is reported as [`CloudError::PartialProvisioning`];
    /// a resource already owned by another cluster stays a `Precondition` error.
    pub async fn tag_created<A: TagCapability + ?Sized>(
        &self,
        api: &A,
        resource: &ResourceRef,
    ) -> Result<()> {
        let operation = format!("tag {}", resource);
        retry_with_backoff_if(&self.retry, &operation, CloudError::is_retryable, || {
            self.ensure_tag(api, resource, &self.owner)
        })
        .await
        .map_err(|(e, attempts)| match e {
            precondition @ CloudError::Precondition { .. } => precondition,
            e => CloudError::PartialProvisioning {
                kind: resource.kind,
                id: resource.id.clone(),
                step: "tagging".to_string(),
                message: format!("gave up after {} attempt(s): {}", attempts, e),
            },
        })
    }

    /// Pick the resource for `identity` out of `candidates`
    ///
    /// Owned candidates always win over foreign ones. Several owned candidates
    /// go through the tie-break; several foreign candidates (with no owned
    /// one) are always ambiguous.
    pub fn select<T: Tagged>(
        &self,
        kind: ResourceKind,
        identity: &str,
        candidates: Vec<T>,
        foreign: ForeignMatch,
    ) -> Result<Option<Resolved<T>>> {
        let (mut owned, mut others): (Vec<T>, Vec<T>) = candidates
            .into_iter()
            .partition(|c| Self::has_tag(c, &self.owner));

        if !owned.is_empty() {
            let resource = if owned.len() == 1 {
                owned.remove(0)
            } else {
                self.break_tie(kind, identity, owned)?
            };
            return Ok(Some(Resolved {
                resource,
                ownership: Ownership::Owned,
            }));
        }

        if foreign == ForeignMatch::Ignore {
            return Ok(None);
        }

        match others.len() {
            0 => Ok(None),
            1 => Ok(Some(Resolved {
                resource: others.remove(0),
                ownership: Ownership::Foreign,
            })),
            _ => Err(ambiguous(kind, identity, &others)),
        }
    }

    fn break_tie<T: Tagged>(&self, kind: ResourceKind, identity: &str, owned: Vec<T>) -> Result<T> {
        if self.tie_break == TieBreak::Strict {
            return Err(ambiguous(kind, identity, &owned));
        }

        if owned.iter().any(|c| c.created().is_none()) {
            return Err(ambiguous(kind, identity, &owned));
        }

        let newest = owned.iter().filter_map(|c| c.created()).max();
        let at_newest = owned.iter().filter(|c| c.created() == newest).count();
        if at_newest != 1 {
            return Err(ambiguous(kind, identity, &owned));
        }

        let ids: Vec<String> = owned.iter().map(|c| c.id().to_string()).collect();
        let picked = owned
            .into_iter()
            .find(|c| c.created() == newest)
            .ok_or_else(|| CloudError::not_found(kind, identity))?;

        tracing::warn!(
            kind = %kind,
            identity,
            candidates = ?ids,
            picked = picked.id(),
            "Multiple owned resources match; picked the most recently created"
        );
        Ok(picked)
    }
}

fn ambiguous<T: Tagged>(kind: ResourceKind, identity: &str, candidates: &[T]) -> CloudError {
    CloudError::Ambiguous {
        kind,
        identity: identity.to_string(),
        candidates: candidates.iter().map(|c| c.id().to_string()).collect(),
    }
}
