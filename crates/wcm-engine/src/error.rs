use thiserror::Error;
use uuid::Uuid;
use wcm_core::{CollectorId, EntityKind, ModelError, RequestId, Role, ScheduleId, StopId};
use wcm_ports::PortError;
use wcm_storage::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot {operation}: {entity} is {current}")]
    InvalidTransition {
        entity: EntityKind,
        current: String,
        operation: &'static str,
    },
    #[error("{entity} {id} was changed concurrently (expected revision {expected}, found {actual}); reload and retry")]
    StaleState {
        entity: &'static str,
        id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("collector {0} not found")]
    CollectorNotFound(CollectorId),
    #[error("schedule {0} has no stops")]
    EmptyRoute(ScheduleId),
    #[error("{0}")]
    Validation(String),
    #[error("request {0} not found")]
    RequestNotFound(RequestId),
    #[error("schedule {0} not found")]
    ScheduleNotFound(ScheduleId),
    #[error("stop {stop} is not on schedule {schedule}")]
    StopNotFound { schedule: ScheduleId, stop: StopId },
    #[error("a {role} may not {operation}")]
    Unauthorized { role: Role, operation: &'static str },
    #[error("payment was not captured: {0}")]
    Payment(#[source] PortError),
    #[error("storage failure: {0}")]
    Storage(#[source] StoreError),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::StaleState { .. } => "stale_state",
            EngineError::CollectorNotFound(_) => "collector_not_found",
            EngineError::EmptyRoute(_) => "empty_route",
            EngineError::Validation(_) => "validation_error",
            EngineError::RequestNotFound(_) => "request_not_found",
            EngineError::ScheduleNotFound(_) => "schedule_not_found",
            EngineError::StopNotFound { .. } => "stop_not_found",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::Payment(_) => "payment_failed",
            EngineError::Storage(_) => "storage_error",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                entity,
                id,
                expected,
                actual,
            } => EngineError::StaleState {
                entity,
                id,
                expected,
                actual,
            },
            StoreError::NotFound { entity: "request", id } => EngineError::RequestNotFound(id),
            StoreError::NotFound { entity: "schedule", id } => EngineError::ScheduleNotFound(id),
            other => EngineError::Storage(other),
        }
    }
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        EngineError::Validation(err.to_string())
    }
}
