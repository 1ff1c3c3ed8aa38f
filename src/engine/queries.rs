use std::collections::HashSet;

use chrono::TimeZone;
use chrono_tz::Tz;
use tracing::warn;
use ulid::Ulid;

use crate::ics;
use crate::model::*;
use crate::observability::AVAILABILITY_FAIL_OPEN_TOTAL;
use crate::store::Order;

use super::availability::open_slots;
use super::conflict::now_ms;
use super::{Engine, EngineError, ensure_admin};

/// Bounds of the calendar day containing `now` in `tz`.
pub(crate) fn local_day(now: Ms, tz: Tz) -> Option<Span> {
    let local = tz.timestamp_millis_opt(now).single()?;
    let date = local.date_naive();
    let start = tz.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).earliest()?;
    let next = date.succ_opt()?;
    let end = tz.from_local_datetime(&next.and_hms_opt(0, 0, 0)?).earliest()?;
    Some(Span::new(start.timestamp_millis(), end.timestamp_millis()))
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<BookingView, EngineError> {
        let booking = self
            .stores
            .bookings
            .get(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        let creator = self.stores.users.get_by_id(booking.created_by).await?;
        let attendees = self.stores.attendees.list_for_booking(id).await?;
        Ok(BookingView {
            booking,
            creator,
            attendees,
        })
    }

    pub async fn attendees(&self, booking_id: Ulid) -> Result<Vec<Attendee>, EngineError> {
        if self.stores.bookings.get(booking_id).await?.is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(self.stores.attendees.list_for_booking(booking_id).await?)
    }

    /// Ordered by start time.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        Ok(self.stores.bookings.query(filter, Order::StartAsc).await?)
    }

    /// Bookings the principal created plus those they are invited to,
    /// each once, ordered by start time.
    pub async fn user_bookings(&self, principal: &Principal) -> Result<Vec<Booking>, EngineError> {
        let created = BookingFilter {
            created_by: Some(principal.id),
            ..Default::default()
        };
        let mut rows = self.stores.bookings.query(&created, Order::StartAsc).await?;
        let mut seen: HashSet<Ulid> = rows.iter().map(|b| b.id).collect();

        for invite in self.stores.attendees.query_by_user(principal.id).await? {
            if !seen.insert(invite.booking_id) {
                continue;
            }
            if let Some(booking) = self.stores.bookings.get(invite.booking_id).await? {
                rows.push(booking);
            }
        }
        rows.sort_by_key(|b| (b.span.start, b.id));
        Ok(rows)
    }

    pub async fn dashboard(
        &self,
        principal: &Principal,
        view: DashboardView,
    ) -> Result<Vec<Booking>, EngineError> {
        self.dashboard_at(principal, view, now_ms()).await
    }

    pub async fn dashboard_at(
        &self,
        principal: &Principal,
        view: DashboardView,
        now: Ms,
    ) -> Result<Vec<Booking>, EngineError> {
        let rows = self.user_bookings(principal).await?;
        Ok(rows
            .into_iter()
            .filter(|b| match view {
                DashboardView::Upcoming => b.is_scheduled() && b.span.start >= now,
                DashboardView::Past => b.span.start < now || b.status == BookingStatus::Completed,
                DashboardView::Cancelled => b.status == BookingStatus::Cancelled,
                DashboardView::All => true,
            })
            .collect())
    }

    pub async fn dashboard_stats(&self, principal: &Principal) -> Result<DashboardStats, EngineError> {
        self.dashboard_stats_at(principal, now_ms()).await
    }

    /// `today` uses the configured timezone's calendar day.
    pub async fn dashboard_stats_at(
        &self,
        principal: &Principal,
        now: Ms,
    ) -> Result<DashboardStats, EngineError> {
        let rows = self.user_bookings(principal).await?;
        let today = local_day(now, self.settings.timezone);
        let created = BookingFilter {
            created_by: Some(principal.id),
            ..Default::default()
        };
        Ok(DashboardStats {
            upcoming: rows
                .iter()
                .filter(|b| b.is_scheduled() && b.span.start >= now)
                .count(),
            today: rows
                .iter()
                .filter(|b| b.is_scheduled() && today.is_some_and(|d| d.contains_instant(b.span.start)))
                .count(),
            total: self.stores.bookings.count(&created).await?,
        })
    }

    pub async fn booking_stats(&self, principal: &Principal) -> Result<BookingStats, EngineError> {
        self.booking_stats_at(principal, now_ms()).await
    }

    pub async fn booking_stats_at(
        &self,
        principal: &Principal,
        now: Ms,
    ) -> Result<BookingStats, EngineError> {
        ensure_admin(principal)?;
        let bookings = &self.stores.bookings;
        let by_status = |status| BookingFilter {
            status: Some(status),
            ..Default::default()
        };
        Ok(BookingStats {
            total: bookings.count(&BookingFilter::default()).await?,
            scheduled: bookings.count(&by_status(BookingStatus::Scheduled)).await?,
            cancelled: bookings.count(&by_status(BookingStatus::Cancelled)).await?,
            completed: bookings.count(&by_status(BookingStatus::Completed)).await?,
            upcoming: bookings
                .count(&BookingFilter {
                    status: Some(BookingStatus::Scheduled),
                    starts_from: Some(now),
                    ..Default::default()
                })
                .await?,
        })
    }

    /// Newest first.
    pub async fn list_users(&self, principal: &Principal) -> Result<Vec<UserProfile>, EngineError> {
        ensure_admin(principal)?;
        Ok(self.stores.users.list().await?)
    }

    pub async fn list_windows(&self) -> Result<Vec<AvailabilityWindow>, EngineError> {
        match &self.stores.availability {
            Some(source) => Ok(source.list_all().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Bookable gaps inside `query`: availability windows minus scheduled bookings.
    pub async fn open_slots(&self, query: Span) -> Result<Vec<Span>, EngineError> {
        let windows = match &self.stores.availability {
            Some(source) => match source.list_all().await {
                Ok(windows) => windows,
                Err(e) => {
                    warn!(error = %e, "availability lookup failed, treating the whole range as open");
                    metrics::counter!(AVAILABILITY_FAIL_OPEN_TOTAL, "cause" => "error").increment(1);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let busy: Vec<Span> = self
            .stores
            .bookings
            .query(
                &BookingFilter {
                    status: Some(BookingStatus::Scheduled),
                    overlapping: Some(query),
                    ..Default::default()
                },
                Order::StartAsc,
            )
            .await?
            .into_iter()
            .map(|b| b.span)
            .collect();
        Ok(open_slots(&windows, &busy, &query))
    }

    /// The calendar invite for a booking, addressed to all its attendees.
    pub async fn export_invite(&self, booking_id: Ulid) -> Result<String, EngineError> {
        let view = self.get_booking(booking_id).await?;
        Ok(ics::render_invite(
            &self.settings.invite,
            &view.booking,
            &view.attendees,
            now_ms(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_day_utc() {
        // 2025-06-15T13:00:00Z
        let now = 1_749_992_400_000;
        let day = local_day(now, chrono_tz::UTC).unwrap();
        assert_eq!(day.start, 1_749_945_600_000);
        assert_eq!(day.duration_ms(), 86_400_000);
    }

    #[test]
    fn local_day_follows_zone() {
        // 2025-06-15T23:30:00Z is already 2025-06-16 in Tokyo
        let now = 1_750_030_200_000;
        let day = local_day(now, chrono_tz::Asia::Tokyo).unwrap();
        // 2025-06-16T00:00:00+09:00
        assert_eq!(day.start, 1_749_999_600_000);
        assert!(day.contains_instant(now));
    }
}
