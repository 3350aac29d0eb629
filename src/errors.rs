use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

/// One itemized entry of an availability failure: which material or product
/// fell short, by how much.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortfall {
    /// Display name of the material or product.
    pub item: String,
    pub required: Decimal,
    pub available: Decimal,
}

impl Shortfall {
    pub fn missing(&self) -> Decimal {
        self.required - self.available
    }
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: required {} / available {}",
            self.item, self.required, self.available
        )
    }
}

fn join_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Malformed ledger write: non-positive quantity, unknown location, or a
    /// location outside the material's tenant. Rejected before any mutation.
    #[error("Invalid movement: {0}")]
    InvalidMovement(String),

    /// Availability pre-check failed; carries the itemized shortfall list so
    /// the caller can render it. No mutation has occurred.
    #[error("Insufficient stock: {}", join_shortfalls(.0))]
    InsufficientStock(Vec<Shortfall>),

    /// An operation validated as sufficient but could not complete its
    /// allocation. Indicates a lost race or a bug; the enclosing transaction
    /// has been rolled back in full.
    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    /// The production warehouse has no active location to receive output.
    #[error("No destination location in warehouse {warehouse_id}")]
    NoDestinationLocation { warehouse_id: i64 },

    /// Lock wait exceeded or the backend reported a serialization conflict.
    /// The whole operation is safe to retry from scratch.
    #[error("Contention: {0}")]
    Contention(String),

    /// The tenant's plan does not allow creating this resource.
    #[error("Plan limit exceeded: {0}")]
    PlanLimitExceeded(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Wraps a database error, routing lock-wait and serialization failures
    /// to [`ServiceError::Contention`] so callers can retry instead of
    /// treating them as fatal.
    pub fn db_error(error: DbErr) -> Self {
        if is_contention(&error) {
            ServiceError::Contention(error.to_string())
        } else {
            ServiceError::DatabaseError(error)
        }
    }

    /// True for failures the caller may resolve by retrying the whole
    /// operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Contention(_))
    }
}

fn is_contention(error: &DbErr) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("lock timeout")
        || msg.contains("lock wait")
        || msg.contains("could not obtain lock")
        || msg.contains("database is locked")
        || msg.contains("deadlock")
        || msg.contains("serialization failure")
}
