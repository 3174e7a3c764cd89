use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval: [{start}, {end})")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("service not found: {0}")]
    ServiceNotFound(Ulid),
    #[error("service {service_id} is not offered by provider {provider_id}")]
    ServiceProviderMismatch { service_id: Ulid, provider_id: Ulid },
    #[error("not found: {0}")]
    NotFound(Ulid),
    /// Lost the race between availability check and commit: the slot was free when
    /// checked but `0` was confirmed first. Retry as a fresh request.
    #[error("conflict with appointment {0} confirmed concurrently")]
    Conflict(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    /// Store failures leave no partial state behind, so the whole operation
    /// may be resubmitted. Everything else is permanent for the same input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::PersistenceFailed(_) | EngineError::StoreUnavailable(_)
        )
    }
}
