//! Reconciliation error taxonomy

use crate::model::ResourceKind;
use thiserror::Error;

/// Errors surfaced by the reconciliation client
///
/// Every variant maps onto exactly one [`ErrorClass`], which is what the
/// external control loop should branch on when deciding whether to requeue.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{operation} {target}: transient {cause} failure: {message}")]
    Transient {
        operation: String,
        target: String,
        cause: TransientCause,
        message: String,
    },

    #[error("{operation} {target}: rejected by cloud API{}: {message}", code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    Rejected {
        operation: String,
        target: String,
        code: Option<u32>,
        message: String,
    },

    #[error("{kind} '{identity}' not found")]
    ResourceNotFound { kind: ResourceKind, identity: String },

    #[error("{kind} '{identity}' is ambiguous: {} equally plausible matches [{}]", candidates.len(), candidates.join(", "))]
    Ambiguous {
        kind: ResourceKind,
        identity: String,
        candidates: Vec<String>,
    },

    #[error("{kind} {id} was created but {step} failed: {message}")]
    PartialProvisioning {
        kind: ResourceKind,
        id: String,
        step: String,
        message: String,
    },

    #[error("Precondition failed for {operation}: {message}")]
    Precondition { operation: String, message: String },
}

/// What went wrong on the wire for a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientCause {
    /// Request or async job exceeded its deadline
    Timeout,
    /// Connection refused, reset, or DNS failure
    Connection,
    /// Remote answered 5xx/429 without a structured rejection
    Unavailable,
}

impl std::fmt::Display for TransientCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientCause::Timeout => write!(f, "timeout"),
            TransientCause::Connection => write!(f, "connection"),
            TransientCause::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Classification of [`CloudError`] for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    TransientNetwork,
    PermanentRejection,
    AmbiguousState,
    PartialProvisioning,
    Precondition,
}

impl CloudError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CloudError::InvalidConfig(_) => ErrorClass::Configuration,
            CloudError::Transient { .. } => ErrorClass::TransientNetwork,
            CloudError::Rejected { .. } | CloudError::ResourceNotFound { .. } => {
                ErrorClass::PermanentRejection
            }
            CloudError::Ambiguous { .. } => ErrorClass::AmbiguousState,
            CloudError::PartialProvisioning { .. } => ErrorClass::PartialProvisioning,
            CloudError::Precondition { .. } => ErrorClass::Precondition,
        }
    }

    /// Whether the caller may retry the same call with back-off
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientNetwork
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CloudError::Transient {
                cause: TransientCause::Timeout,
                ..
            }
        )
    }

    pub(crate) fn precondition(operation: &str, message: impl Into<String>) -> Self {
        CloudError::Precondition {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(kind: ResourceKind, identity: impl Into<String>) -> Self {
        CloudError::ResourceNotFound {
            kind,
            identity: identity.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
