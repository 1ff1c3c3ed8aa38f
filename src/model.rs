use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Some(BookingStatus::Scheduled),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    pub max_attendees: u32,
    pub status: BookingStatus,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Event reference at the calendar provider, once synced.
    pub calendar_event_id: Option<String>,
}

impl Booking {
    pub fn is_scheduled(&self) -> bool {
        self.status == BookingStatus::Scheduled
    }
}

/// Row handed to the store on creation; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    pub max_attendees: u32,
    pub created_by: Ulid,
}

/// Field changes applied by `BookingStore::update`. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub span: Option<Span>,
    pub location: Option<Option<String>>,
    pub meeting_link: Option<Option<String>>,
    pub max_attendees: Option<u32>,
    pub status: Option<BookingStatus>,
}

impl BookingPatch {
    pub fn status(status: BookingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, booking: &mut Booking) {
        if let Some(title) = &self.title {
            booking.title = title.clone();
        }
        if let Some(description) = &self.description {
            booking.description = description.clone();
        }
        if let Some(span) = self.span {
            booking.span = span;
        }
        if let Some(location) = &self.location {
            booking.location = location.clone();
        }
        if let Some(link) = &self.meeting_link {
            booking.meeting_link = link.clone();
        }
        if let Some(max) = self.max_attendees {
            booking.max_attendees = max;
        }
        if let Some(status) = self.status {
            booking.status = status;
        }
    }
}

/// A booking as submitted by a user, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub title: String,
    pub description: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    pub max_attendees: Option<u32>,
    pub attendees: Vec<AttendeeInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub created_by: Option<Ulid>,
    /// Only bookings whose span overlaps this one.
    pub overlapping: Option<Span>,
    pub exclude_id: Option<Ulid>,
    /// Only bookings starting at or after this instant.
    pub starts_from: Option<Ms>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        if let Some(status) = self.status
            && booking.status != status
        {
            return false;
        }
        if let Some(creator) = self.created_by
            && booking.created_by != creator
        {
            return false;
        }
        if let Some(span) = &self.overlapping
            && !booking.span.overlaps(span)
        {
            return false;
        }
        if self.exclude_id == Some(booking.id) {
            return false;
        }
        if let Some(from) = self.starts_from
            && booking.span.start < from
        {
            return false;
        }
        true
    }
}

// ── Attendees ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendeeStatus {
    Pending,
    Confirmed,
    Declined,
}

impl AttendeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendeeStatus::Pending => "pending",
            AttendeeStatus::Confirmed => "confirmed",
            AttendeeStatus::Declined => "declined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub email: String,
    /// Name typed on the booking form. Never replaced by a profile name.
    pub full_name: String,
    pub user_id: Option<Ulid>,
    pub status: AttendeeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendeeInput {
    pub email: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttendee {
    pub email: String,
    pub full_name: String,
    pub user_id: Option<Ulid>,
    pub status: AttendeeStatus,
}

// ── Users ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
    Owner,
    Developer,
    Tester,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Owner => "owner",
            Role::Developer => "developer",
            Role::Tester => "tester",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            "owner" => Some(Role::Owner),
            "developer" => Some(Role::Developer),
            "tester" => Some(Role::Tester),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        *self == Role::Admin
    }

    /// Operational accounts whose outgoing e-mail may be suppressed.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Owner | Role::Developer | Role::Tester | Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Ulid,
    pub email: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Role,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Identity-provider data used to create or refresh a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUpsert {
    pub email: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    /// Role given only when the profile is created.
    pub initial_role: Role,
}

/// The signed-in user an operation runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: Ulid,
    pub email: String,
    pub role: Role,
    /// OAuth access token for the calendar provider, if the session has one.
    pub provider_token: Option<String>,
}

// ── Availability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub span: Span,
}

// ── WAL records ──────────────────────────────────────────────────

/// Store mutations, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// Upsert a booking together with its full attendee set.
    BookingSaved {
        booking: Booking,
        attendees: Vec<Attendee>,
    },
    BookingWritten {
        booking: Booking,
    },
    AttendeesReplaced {
        booking_id: Ulid,
        attendees: Vec<Attendee>,
    },
    BookingDeleted {
        id: Ulid,
    },
    UserWritten {
        user: UserProfile,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
    },
}

// ── Domain events ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Created,
    Updated,
    Cancelled,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Created => "booking_created",
            NotificationKind::Updated => "booking_updated",
            NotificationKind::Cancelled => "booking_cancelled",
        }
    }
}

/// Events broadcast on the notify hub after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingEvent {
    Created(Booking),
    Updated(Booking),
    Cancelled(Booking),
    Deleted { id: Ulid },
    Completed { id: Ulid },
    NotificationSent {
        booking_id: Ulid,
        kind: NotificationKind,
        success: bool,
        detail: String,
    },
}

impl BookingEvent {
    pub fn booking_id(&self) -> Ulid {
        match self {
            BookingEvent::Created(b) | BookingEvent::Updated(b) | BookingEvent::Cancelled(b) => b.id,
            BookingEvent::Deleted { id } | BookingEvent::Completed { id } => *id,
            BookingEvent::NotificationSent { booking_id, .. } => *booking_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub creator: Option<UserProfile>,
    pub attendees: Vec<Attendee>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total: usize,
    pub scheduled: usize,
    pub cancelled: usize,
    pub completed: usize,
    pub upcoming: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DashboardStats {
    pub upcoming: usize,
    pub today: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardView {
    Upcoming,
    Past,
    Cancelled,
    All,
}

impl DashboardView {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upcoming" => Some(DashboardView::Upcoming),
            "past" => Some(DashboardView::Past),
            "cancelled" | "canceled" => Some(DashboardView::Cancelled),
            "all" => Some(DashboardView::All),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            title: "Sync".into(),
            description: None,
            span: Span::new(start, end),
            location: None,
            meeting_link: None,
            max_attendees: 10,
            status,
            created_by: Ulid::new(),
            created_at: 0,
            updated_at: 0,
            calendar_event_id: None,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_single_ms_overlap() {
        assert!(Span::new(100, 201).overlaps(&Span::new(200, 300)));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn filter_matches_status_and_creator() {
        let b = booking(100, 200, BookingStatus::Scheduled);
        assert!(BookingFilter::default().matches(&b));

        let by_status = BookingFilter {
            status: Some(BookingStatus::Cancelled),
            ..Default::default()
        };
        assert!(!by_status.matches(&b));

        let by_creator = BookingFilter {
            created_by: Some(b.created_by),
            ..Default::default()
        };
        assert!(by_creator.matches(&b));
    }

    #[test]
    fn filter_overlap_and_exclusion() {
        let b = booking(100, 200, BookingStatus::Scheduled);
        let overlapping = BookingFilter {
            overlapping: Some(Span::new(150, 250)),
            ..Default::default()
        };
        assert!(overlapping.matches(&b));

        let touching = BookingFilter {
            overlapping: Some(Span::new(200, 250)),
            ..Default::default()
        };
        assert!(!touching.matches(&b));

        let excluded = BookingFilter {
            overlapping: Some(Span::new(150, 250)),
            exclude_id: Some(b.id),
            ..Default::default()
        };
        assert!(!excluded.matches(&b));
    }

    #[test]
    fn filter_starts_from() {
        let b = booking(100, 200, BookingStatus::Scheduled);
        let from = |t| BookingFilter {
            starts_from: Some(t),
            ..Default::default()
        };
        assert!(from(100).matches(&b));
        assert!(!from(101).matches(&b));
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut b = booking(100, 200, BookingStatus::Scheduled);
        b.location = Some("Room 1".into());
        let patch = BookingPatch {
            title: Some("Retro".into()),
            location: Some(None),
            ..Default::default()
        };
        patch.apply(&mut b);
        assert_eq!(b.title, "Retro");
        assert_eq!(b.location, None);
        assert_eq!(b.span, Span::new(100, 200));
        assert_eq!(b.status, BookingStatus::Scheduled);
    }

    #[test]
    fn role_privileges() {
        assert!(Role::Admin.is_admin());
        assert!(!Role::Owner.is_admin());
        for role in [Role::Owner, Role::Developer, Role::Tester, Role::Admin] {
            assert!(role.is_privileged());
        }
        assert!(!Role::User.is_privileged());
    }

    #[test]
    fn enum_string_forms() {
        assert_eq!(Role::parse("ADMIN"), Some(Role::Admin));
        assert_eq!(Role::parse("root"), None);
        assert_eq!(BookingStatus::parse("canceled"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::Completed.as_str(), "completed");
        assert_eq!(DashboardView::parse("past"), Some(DashboardView::Past));
        assert_eq!(NotificationKind::Updated.as_str(), "booking_updated");
    }

    #[test]
    fn record_serialization_roundtrip() {
        let b = booking(100, 200, BookingStatus::Scheduled);
        let record = Record::BookingSaved {
            attendees: vec![Attendee {
                id: Ulid::new(),
                booking_id: b.id,
                email: "a@x.com".into(),
                full_name: "A".into(),
                user_id: None,
                status: AttendeeStatus::Pending,
            }],
            booking: b,
        };
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: Record = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
