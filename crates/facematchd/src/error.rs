//! Service error taxonomy and its mapping onto D-Bus errors.

use crate::engine::EngineError;
use facematch_core::MatchError;
use facematch_store::{JobQueueError, ObjectStoreError, RegistryError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Caller input is malformed; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),
    /// No usable face in the image; nothing was written.
    #[error("extraction: {0}")]
    Extraction(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// A collaborator is unreachable, failed or timed out.
    #[error("dependency unavailable: {0}")]
    Dependency(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn no_face() -> Self {
        ServiceError::Extraction("no face detected in image".into())
    }

    pub fn timeout(what: &str, after: std::time::Duration) -> Self {
        ServiceError::Dependency(format!("{what} timed out after {}s", after.as_secs_f32()))
    }
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DimensionMismatch { .. } | RegistryError::EmptyEmbedding | RegistryError::MissingIdentity => {
                ServiceError::Validation(e.to_string())
            }
            RegistryError::NotFound(_) => ServiceError::NotFound(e.to_string()),
            RegistryError::Sqlite(_) | RegistryError::Io(_) => ServiceError::Dependency(format!("registry: {e}")),
            RegistryError::Metadata(_) | RegistryError::Poisoned => ServiceError::Internal(format!("registry: {e}")),
        }
    }
}

impl From<ObjectStoreError> for ServiceError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::InvalidPath(_) => ServiceError::Validation(e.to_string()),
            ObjectStoreError::NotFound(_) => ServiceError::NotFound(e.to_string()),
            ObjectStoreError::Endpoint(_) | ObjectStoreError::Io(_) | ObjectStoreError::Http(_) | ObjectStoreError::Status { .. } => {
                ServiceError::Dependency(e.to_string())
            }
        }
    }
}

impl From<JobQueueError> for ServiceError {
    fn from(e: JobQueueError) -> Self {
        match e {
            JobQueueError::NotFound(_) => ServiceError::NotFound(e.to_string()),
            JobQueueError::Sqlite(_) | JobQueueError::Io(_) => ServiceError::Dependency(format!("job queue: {e}")),
            _ => ServiceError::Internal(format!("job queue: {e}")),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Extraction(inner) if inner.is_input_error() => ServiceError::Extraction(inner.to_string()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<MatchError> for ServiceError {
    fn from(e: MatchError) -> Self {
        ServiceError::Validation(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Internal(format!("blocking task: {e}"))
    }
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Validation(msg) => zbus::fdo::Error::InvalidArgs(msg),
            ServiceError::Extraction(msg) => zbus::fdo::Error::Failed(format!("extraction: {msg}")),
            ServiceError::NotFound(msg) => zbus::fdo::Error::UnknownObject(msg),
            ServiceError::Dependency(msg) => zbus::fdo::Error::IOError(msg),
            ServiceError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                zbus::fdo::Error::Failed("internal error".into())
            }
        }
    }
}
