use thiserror::Error;
use ulid::Ulid;

use crate::model::Status;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("booking not found: {0}")]
    NotFound(Ulid),
    #[error("booking already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },
    #[error("booking {id} not eligible: {reason}")]
    NotEligible { id: Ulid, reason: &'static str },
    #[error("conflict on booking {0}: concurrent update won")]
    Conflict(Ulid),
    #[error("not permitted: {0}")]
    Forbidden(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    pub(crate) fn not_eligible(id: Ulid, reason: &'static str) -> Self {
        EngineError::NotEligible { id, reason }
    }

    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotEligible { .. } => "not_eligible",
            EngineError::Conflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}
