use crate::model::Ms;

/// Longest booking accepted at creation or edit time.
pub const MAX_BOOKING_DURATION_MS: Ms = 3_600_000;

pub const DEFAULT_MAX_ATTENDEES: u32 = 10;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 5_000;
pub const MAX_LOCATION_LEN: usize = 500;
pub const MAX_LINK_LEN: usize = 2_048;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_ATTENDEES_PER_BOOKING: usize = 500;

/// 2000-01-01T00:00:00Z .. 2100-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
