use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{ReservationStatus, TimeSlot};

/// Every failure the engine reports. Variants are discriminable so callers
/// can branch ("slot taken" vs "not found") without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },

    /// A store-level unique constraint rejected the write.
    #[error("duplicate key on {constraint}: {key}")]
    DuplicateKey { constraint: &'static str, key: String },

    /// The reservation uniqueness constraint rejected a booking.
    #[error("slot {slot} on {date} is already booked for business {business_id}")]
    SlotAlreadyBooked {
        business_id: Ulid,
        date: NaiveDate,
        slot: TimeSlot,
    },

    #[error("slot {slot} on {date} is outside the availability of business {business_id}")]
    OutsideAvailability {
        business_id: Ulid,
        date: NaiveDate,
        slot: TimeSlot,
    },

    #[error("policy violation: {0}")]
    PolicyViolation(&'static str),

    /// Configuration conflict among availability rules; needs operator correction.
    #[error("ambiguous availability for business {business_id} on {date}: rules {rules:?} tie")]
    AmbiguousAvailability {
        business_id: Ulid,
        date: NaiveDate,
        rules: Vec<Ulid>,
    },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::DuplicateKey { .. } => "duplicate_key",
            EngineError::SlotAlreadyBooked { .. } => "slot_already_booked",
            EngineError::OutsideAvailability { .. } => "outside_availability",
            EngineError::PolicyViolation(_) => "policy_violation",
            EngineError::AmbiguousAvailability { .. } => "ambiguous_availability",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
