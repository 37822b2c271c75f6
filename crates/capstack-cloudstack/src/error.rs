//! CloudStack gateway error types

use capstack_cloud::{CloudError, TransientCause};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("async job {job_id} still pending after {waited_secs}s")]
    JobTimeout { job_id: String, waited_secs: u64 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("service unavailable (HTTP {status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("API error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("async job {job_id} failed with {code}: {message}")]
    JobFailed {
        job_id: String,
        code: u32,
        message: String,
    },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Network-level failures the caller may retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::JobTimeout { .. }
                | GatewayError::Connection(_)
                | GatewayError::Unavailable { .. }
        )
    }

    /// Wrap with the remote operation and target identity
    pub fn context(self, operation: &str, target: &str) -> CloudError {
        let transient = |cause| CloudError::Transient {
            operation: operation.to_string(),
            target: target.to_string(),
            cause,
            message: self.to_string(),
        };

        match &self {
            GatewayError::Timeout(_) | GatewayError::JobTimeout { .. } => {
                transient(TransientCause::Timeout)
            }
            GatewayError::Connection(_) => transient(TransientCause::Connection),
            GatewayError::Unavailable { .. } => transient(TransientCause::Unavailable),
            GatewayError::Api { code, message } | GatewayError::JobFailed { code, message, .. } => {
                CloudError::Rejected {
                    operation: operation.to_string(),
                    target: target.to_string(),
                    code: Some(*code),
                    message: message.clone(),
                }
            }
            GatewayError::Http { .. } | GatewayError::Decode(_) | GatewayError::InvalidRequest(_) => {
                CloudError::Rejected {
                    operation: operation.to_string(),
                    target: target.to_string(),
                    code: None,
                    message: self.to_string(),
                }
            }
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout(e.to_string())
        } else if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else if e.is_builder() {
            GatewayError::InvalidRequest(e.to_string())
        } else {
            GatewayError::Connection(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
