use ulid::Ulid;

use crate::model::ConflictReason;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("unit {0} is inactive")]
    UnitInactive(Ulid),
    #[error("unit {unit_id} not available: {}", describe(.conflicts))]
    NotAvailable {
        unit_id: Ulid,
        conflicts: Vec<ConflictReason>,
    },
    /// Raised by the atomic re-check on occupancy creation. Callers treat it
    /// exactly like `NotAvailable`.
    #[error("conflict on unit {unit_id}: {}", describe(.conflicts))]
    Conflict {
        unit_id: Ulid,
        conflicts: Vec<ConflictReason>,
    },
    #[error("hold expired: {0}")]
    HoldExpired(Ulid),
    #[error("hold not found: {0}")]
    HoldNotFound(Ulid),
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        to: &'static str,
    },
    #[error("timed out waiting for lock on unit {0}")]
    LockTimeout(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl EngineError {
    /// The requested range is taken. An expected business outcome.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EngineError::NotAvailable { .. } | EngineError::Conflict { .. })
    }

    /// Safe to retry after backoff. Writes must re-check availability first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout(_) | EngineError::Infrastructure(_))
    }

    pub fn conflicts(&self) -> &[ConflictReason] {
        match self {
            EngineError::NotAvailable { conflicts, .. } | EngineError::Conflict { conflicts, .. } => {
                conflicts
            }
            _ => &[],
        }
    }
}

fn describe(conflicts: &[ConflictReason]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
