use crate::job::JobStatus;

/// Domain-level error shared by the store, the lifecycle engine and the
/// HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    /// The job exists but has not produced a result (yet).
    #[error("Result not available for job {id} (status: {status})")]
    ResultNotReady { id: String, status: JobStatus },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Payload too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge { size_bytes: u64, limit_bytes: u64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing or malformed credential.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Well-formed credential that does not match.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A state-machine transition that the lifecycle never performs.
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a missing job.
    pub fn job_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity: "Job",
            id: id.into(),
        }
    }
}
