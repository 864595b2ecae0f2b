use thiserror::Error;

use crate::broker::RejectionType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Command rejected ({rejection_type}): {reason}")]
    Rejected {
        rejection_type: RejectionType,
        reason: String,
    },

    #[error("Failed to deliver activated jobs: {0}")]
    DeliveryFailed(String),

    #[error("Request was canceled by the client")]
    Canceled,

    #[error("Failed to activate jobs of type '{job_type}': {}", errors.join("; "))]
    PartitionsFailed {
        job_type: String,
        errors: Vec<String>,
    },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Errors caused by backpressure that a client may retry after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::ResourceExhausted(_)
                | GatewayError::Unavailable(_)
                | GatewayError::PartitionsFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
