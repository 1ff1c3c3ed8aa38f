use ulid::Ulid;

use crate::model::BookingStatus;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── validation ──
    #[error("start time must be in the future")]
    PastStart,
    #[error("end time must be after start time")]
    InvertedRange,
    #[error("booking duration cannot exceed 1 hour")]
    DurationExceeded,
    #[error("please add at least one attendee with name and email")]
    NoAttendees,
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("time slot is outside the available hours")]
    OutsideAvailability,

    // ── conflict ──
    #[error("time slot conflicts with an existing booking ({0})")]
    Conflict(Ulid),

    // ── lifecycle / authorization ──
    #[error("booking not found: {0}")]
    NotFound(Ulid),
    #[error("only the booking creator can modify it")]
    NotOwner,
    #[error("admin role required")]
    AdminOnly,
    #[error("booking is {}, not scheduled", .0.as_str())]
    NotScheduled(BookingStatus),

    // ── write failures ──
    #[error("failed to save booking")]
    Storage(#[source] StoreError),
}

impl EngineError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::PastStart
                | EngineError::InvertedRange
                | EngineError::DurationExceeded
                | EngineError::NoAttendees
                | EngineError::InvalidField { .. }
                | EngineError::OutsideAvailability
        )
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::PastStart => "past_start",
            EngineError::InvertedRange => "inverted_range",
            EngineError::DurationExceeded => "duration_exceeded",
            EngineError::NoAttendees => "no_attendees",
            EngineError::InvalidField { .. } => "invalid_field",
            EngineError::OutsideAvailability => "outside_availability",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::NotOwner => "not_owner",
            EngineError::AdminOnly => "admin_only",
            EngineError::NotScheduled(_) => "not_scheduled",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Exclusion(id) => EngineError::Conflict(id),
            other => EngineError::Storage(other),
        }
    }
}
