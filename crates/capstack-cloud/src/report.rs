//! What a reconciliation pass did, per resource

use crate::model::ResourceKind;
use serde::{Deserialize, Serialize};

/// Outcome for one resource in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Already existed and was found
    Resolved,
    /// Provisioned and tagged in this pass
    Created,
    /// Left untagged by an earlier pass and tagged in this one
    Claimed,
    /// Nothing to do (e.g. firewall already satisfied)
    Unchanged,
    /// Owned resource removed
    Deleted,
    /// Foreign resource left in place during teardown
    Retained,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Resolved => write!(f, "resolved"),
            ActionType::Created => write!(f, "created"),
            ActionType::Claimed => write!(f, "claimed"),
            ActionType::Unchanged => write!(f, "unchanged"),
            ActionType::Deleted => write!(f, "deleted"),
            ActionType::Retained => write!(f, "retained"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub action_type: ActionType,
    pub description: String,
}

/// Record of one `reconcile_cluster` / `delete_cluster` pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassReport {
    pub actions: Vec<Action>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl PassReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        kind: ResourceKind,
        resource_id: impl Into<String>,
        action_type: ActionType,
        description: impl Into<String>,
    ) {
        let action = Action {
            kind,
            resource_id: resource_id.into(),
            action_type,
            description: description.into(),
        };
        tracing::debug!(
            "{} {} {}: {}",
            action.kind,
            action.resource_id,
            action.action_type,
            action.description
        );
        self.actions.push(action);
    }

    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    pub fn find(&self, kind: ResourceKind) -> Option<&Action> {
        self.actions.iter().find(|a| a.kind == kind)
    }

    /// True when the pass changed nothing remotely
    pub fn is_converged(&self) -> bool {
        self.actions
            .iter()
            .all(|a| !matches!(
                a.action_type,
                ActionType::Created | ActionType::Claimed | ActionType::Deleted
            ))
    }

    pub fn summary(&self) -> PassSummary {
        PassSummary {
            created: self.actions_by_type(ActionType::Created).len(),
            claimed: self.actions_by_type(ActionType::Claimed).len(),
            resolved: self.actions_by_type(ActionType::Resolved).len(),
            unchanged: self.actions_by_type(ActionType::Unchanged).len(),
            deleted: self.actions_by_type(ActionType::Deleted).len(),
            retained: self.actions_by_type(ActionType::Retained).len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub created: usize,
    pub claimed: usize,
    pub resolved: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub retained: usize,
}

impl std::fmt::Display for PassSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} claimed, {} resolved, {} unchanged, {} deleted, {} retained",
            self.created, self.claimed, self.resolved, self.unchanged, self.deleted, self.retained
        )
    }
}
