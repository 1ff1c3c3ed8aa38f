mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    /// Storage-side exclusion constraint over scheduled time ranges.
    #[error("overlaps scheduled booking {0}")]
    Exclusion(Ulid),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    StartAsc,
    StartDesc,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert(&self, booking: NewBooking, now: Ms) -> Result<Booking, StoreError>;
    async fn update(&self, id: Ulid, patch: BookingPatch, now: Ms) -> Result<Booking, StoreError>;
    async fn delete(&self, id: Ulid) -> Result<(), StoreError>;
    async fn get(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
    async fn query(&self, filter: &BookingFilter, order: Order) -> Result<Vec<Booking>, StoreError>;
    async fn count(&self, filter: &BookingFilter) -> Result<usize, StoreError>;
    async fn set_calendar_ref(&self, id: Ulid, event_id: Option<String>) -> Result<(), StoreError>;

    /// Insert a booking and its attendees as one unit. `None` means the
    /// backend has no atomic unit and the caller must write in two steps.
    async fn create_atomic(
        &self,
        _booking: NewBooking,
        _attendees: Vec<NewAttendee>,
        _now: Ms,
    ) -> Result<Option<(Booking, Vec<Attendee>)>, StoreError> {
        Ok(None)
    }

    /// Patch a booking and replace its attendee set as one unit.
    async fn replace_atomic(
        &self,
        _id: Ulid,
        _patch: BookingPatch,
        _attendees: Vec<NewAttendee>,
        _now: Ms,
    ) -> Result<Option<(Booking, Vec<Attendee>)>, StoreError> {
        Ok(None)
    }
}

#[async_trait]
pub trait AttendeeStore: Send + Sync {
    async fn insert_many(
        &self,
        booking_id: Ulid,
        rows: Vec<NewAttendee>,
    ) -> Result<Vec<Attendee>, StoreError>;
    async fn delete_all(&self, booking_id: Ulid) -> Result<(), StoreError>;
    async fn list_for_booking(&self, booking_id: Ulid) -> Result<Vec<Attendee>, StoreError>;
    async fn query_by_user(&self, user_id: Ulid) -> Result<Vec<Attendee>, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create the profile, or refresh name and avatar of an existing one.
    async fn upsert(&self, profile: ProfileUpsert, now: Ms) -> Result<UserProfile, StoreError>;
    async fn get_by_id(&self, id: Ulid) -> Result<Option<UserProfile>, StoreError>;
    async fn get_by_email(&self, email: &str) -> Result<Option<UserProfile>, StoreError>;
    async fn update_role(&self, id: Ulid, role: Role, now: Ms) -> Result<UserProfile, StoreError>;
    /// Newest first.
    async fn list(&self) -> Result<Vec<UserProfile>, StoreError>;
}

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<AvailabilityWindow>, StoreError>;
    async fn insert_window(&self, span: Span) -> Result<AvailabilityWindow, StoreError>;
    async fn remove_window(&self, id: Ulid) -> Result<(), StoreError>;
}

/// The storage collaborators the engine talks to.
#[derive(Clone)]
pub struct Stores {
    pub bookings: Arc<dyn BookingStore>,
    pub attendees: Arc<dyn AttendeeStore>,
    pub users: Arc<dyn UserStore>,
    /// `None` when no availability source is configured: everything is allowed.
    pub availability: Option<Arc<dyn AvailabilityStore>>,
}

impl Stores {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            bookings: store.clone(),
            attendees: store.clone(),
            users: store.clone(),
            availability: Some(store),
        }
    }
}
