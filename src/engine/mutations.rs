use tracing::{info, warn};
use ulid::Ulid;

use crate::dispatch::Job;
use crate::model::*;
use crate::observability::{BOOKINGS_WRITTEN_TOTAL, BOOKING_REJECTIONS_TOTAL};
use crate::store::{Order, StoreError};

use super::availability::is_within_availability;
use super::conflict::{find_conflict, now_ms};
use super::validate::{CheckedDraft, check_draft, validate_range};
use super::{Engine, EngineError, ensure_admin, ensure_owner};

fn rejected(op: &'static str, e: EngineError) -> EngineError {
    metrics::counter!(BOOKING_REJECTIONS_TOTAL, "op" => op, "reason" => e.reason()).increment(1);
    e
}

fn written(op: &'static str) {
    metrics::counter!(BOOKINGS_WRITTEN_TOTAL, "op" => op).increment(1);
}

impl Engine {
    pub async fn create_booking(
        &self,
        principal: &Principal,
        draft: BookingDraft,
    ) -> Result<(Booking, Vec<Attendee>), EngineError> {
        self.create_booking_at(principal, draft, now_ms()).await
    }

    /// Guards run in order and stop at the first failure: draft fields,
    /// time range, availability, conflict. Only then is anything written.
    pub async fn create_booking_at(
        &self,
        principal: &Principal,
        draft: BookingDraft,
        now: Ms,
    ) -> Result<(Booking, Vec<Attendee>), EngineError> {
        let (checked, span) = self
            .guard(&draft, now, None)
            .await
            .map_err(|e| rejected("create", e))?;

        let attendees = self.attendee_rows(&checked.attendees).await;
        let new = NewBooking {
            title: checked.title,
            description: checked.description,
            span,
            location: checked.location,
            meeting_link: checked.meeting_link,
            max_attendees: checked.max_attendees,
            created_by: principal.id,
        };

        let (booking, attendees) = self.write_new(new, attendees, now).await?;
        written("create");
        info!(booking_id = %booking.id, created_by = %principal.id, attendees = attendees.len(), "booking created");

        let mut jobs = vec![Job::Notify {
            kind: NotificationKind::Created,
            booking: booking.clone(),
            attendees: attendees.clone(),
        }];
        if let Some(token) = &principal.provider_token {
            jobs.push(Job::CalendarCreate {
                booking: booking.clone(),
                attendees: attendees.clone(),
                token: token.clone(),
            });
        }
        self.fan_out(BookingEvent::Created(booking.clone()), jobs);
        Ok((booking, attendees))
    }

    pub async fn update_booking(
        &self,
        principal: &Principal,
        id: Ulid,
        draft: BookingDraft,
    ) -> Result<(Booking, Vec<Attendee>), EngineError> {
        self.update_booking_at(principal, id, draft, now_ms()).await
    }

    /// Full replacement of the booking's fields and attendee set. The
    /// conflict check ignores the booking itself.
    pub async fn update_booking_at(
        &self,
        principal: &Principal,
        id: Ulid,
        draft: BookingDraft,
        now: Ms,
    ) -> Result<(Booking, Vec<Attendee>), EngineError> {
        let current = self.owned_booking(principal, id).await?;
        if !current.is_scheduled() {
            return Err(rejected("update", EngineError::NotScheduled(current.status)));
        }
        let (checked, span) = self
            .guard(&draft, now, Some(id))
            .await
            .map_err(|e| rejected("update", e))?;

        let attendees = self.attendee_rows(&checked.attendees).await;
        let patch = BookingPatch {
            title: Some(checked.title),
            description: Some(checked.description),
            span: Some(span),
            location: Some(checked.location),
            meeting_link: Some(checked.meeting_link),
            max_attendees: Some(checked.max_attendees),
            status: None,
        };

        let (booking, attendees) = match self
            .stores
            .bookings
            .replace_atomic(id, patch.clone(), attendees.clone(), now)
            .await?
        {
            Some(done) => done,
            None => {
                let booking = self.stores.bookings.update(id, patch, now).await?;
                self.stores.attendees.delete_all(id).await?;
                let attendees = self.stores.attendees.insert_many(id, attendees).await?;
                (booking, attendees)
            }
        };
        written("update");
        info!(booking_id = %id, attendees = attendees.len(), "booking updated");

        let mut jobs = vec![Job::Notify {
            kind: NotificationKind::Updated,
            booking: booking.clone(),
            attendees: attendees.clone(),
        }];
        if let Some(token) = &principal.provider_token {
            jobs.push(Job::CalendarUpdate {
                booking: booking.clone(),
                attendees: attendees.clone(),
                token: token.clone(),
            });
        }
        self.fan_out(BookingEvent::Updated(booking.clone()), jobs);
        Ok((booking, attendees))
    }

    pub async fn cancel_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        self.cancel_booking_at(principal, id, now_ms()).await
    }

    /// Cancelling a cancelled booking returns it unchanged.
    pub async fn cancel_booking_at(
        &self,
        principal: &Principal,
        id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let current = self.owned_booking(principal, id).await?;
        match current.status {
            BookingStatus::Cancelled => return Ok(current),
            BookingStatus::Completed => {
                return Err(rejected("cancel", EngineError::NotScheduled(current.status)));
            }
            BookingStatus::Scheduled => {}
        }

        let booking = self
            .stores
            .bookings
            .update(id, BookingPatch::status(BookingStatus::Cancelled), now)
            .await?;
        written("cancel");
        info!(booking_id = %id, "booking cancelled");

        let attendees = match self.stores.attendees.list_for_booking(id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(booking_id = %id, error = %e, "could not load attendees for cancellation notice");
                Vec::new()
            }
        };
        let mut jobs = vec![Job::Notify {
            kind: NotificationKind::Cancelled,
            booking: booking.clone(),
            attendees,
        }];
        if let (Some(token), Some(event_id)) = (&principal.provider_token, &booking.calendar_event_id) {
            jobs.push(Job::CalendarDelete {
                booking_id: id,
                event_id: event_id.clone(),
                token: token.clone(),
                clear_ref: true,
            });
        }
        self.fan_out(BookingEvent::Cancelled(booking.clone()), jobs);
        Ok(booking)
    }

    /// Removes the booking and its attendees whatever the status.
    pub async fn delete_booking(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        let current = self.owned_booking(principal, id).await?;
        self.stores.attendees.delete_all(id).await?;
        self.stores.bookings.delete(id).await?;
        written("delete");
        info!(booking_id = %id, "booking deleted");

        let mut jobs = Vec::new();
        if let (Some(token), Some(event_id)) = (&principal.provider_token, current.calendar_event_id) {
            jobs.push(Job::CalendarDelete {
                booking_id: id,
                event_id,
                token: token.clone(),
                clear_ref: false,
            });
        }
        self.fan_out(BookingEvent::Deleted { id }, jobs);
        self.notify.remove(&id);
        Ok(())
    }

    /// Mark scheduled bookings that have ended as completed.
    pub async fn complete_expired(&self, now: Ms) -> Result<usize, EngineError> {
        let filter = BookingFilter {
            status: Some(BookingStatus::Scheduled),
            ..Default::default()
        };
        let ended: Vec<Booking> = self
            .stores
            .bookings
            .query(&filter, Order::StartAsc)
            .await?
            .into_iter()
            .filter(|b| b.span.end <= now)
            .collect();

        let mut completed = 0;
        for booking in ended {
            match self
                .stores
                .bookings
                .update(booking.id, BookingPatch::status(BookingStatus::Completed), now)
                .await
            {
                Ok(_) => {
                    completed += 1;
                    written("complete");
                    self.notify.send(&BookingEvent::Completed { id: booking.id });
                }
                // Deleted or changed since the query; skip it.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if completed > 0 {
            info!(completed, "marked ended bookings completed");
        }
        Ok(completed)
    }

    // ── Administration ───────────────────────────────────────

    pub async fn set_role(
        &self,
        principal: &Principal,
        user_id: Ulid,
        role: Role,
    ) -> Result<UserProfile, EngineError> {
        ensure_admin(principal)?;
        let user = self.stores.users.update_role(user_id, role, now_ms()).await?;
        info!(user_id = %user_id, role = role.as_str(), by = %principal.id, "role changed");
        Ok(user)
    }

    pub async fn add_window(
        &self,
        principal: &Principal,
        start: Ms,
        end: Ms,
    ) -> Result<AvailabilityWindow, EngineError> {
        ensure_admin(principal)?;
        if end <= start {
            return Err(EngineError::InvertedRange);
        }
        let source = self.availability_source()?;
        let window = source.insert_window(Span::new(start, end)).await?;
        info!(window_id = %window.id, start, end, "availability window added");
        Ok(window)
    }

    pub async fn remove_window(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        ensure_admin(principal)?;
        self.availability_source()?.remove_window(id).await?;
        info!(window_id = %id, "availability window removed");
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────

    fn availability_source(
        &self,
    ) -> Result<&std::sync::Arc<dyn crate::store::AvailabilityStore>, EngineError> {
        self.stores.availability.as_ref().ok_or_else(|| {
            EngineError::Storage(StoreError::Unavailable("no availability source configured".into()))
        })
    }

    pub(super) async fn owned_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self
            .stores
            .bookings
            .get(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        ensure_owner(principal, &booking)?;
        Ok(booking)
    }

    async fn guard(
        &self,
        draft: &BookingDraft,
        now: Ms,
        exclude: Option<Ulid>,
    ) -> Result<(CheckedDraft, Span), EngineError> {
        let checked = check_draft(draft)?;
        let span = validate_range(draft.start, draft.end, now)?;
        if !is_within_availability(self.stores.availability.as_ref(), &span).await {
            return Err(EngineError::OutsideAvailability);
        }
        if let Some(existing) = find_conflict(self.stores.bookings.as_ref(), &span, exclude).await? {
            info!(conflicting = %existing, start = span.start, end = span.end, "booking rejected: conflict");
            return Err(EngineError::Conflict(existing));
        }
        Ok((checked, span))
    }

    /// Attendees link to a registered user when the e-mail matches one.
    async fn attendee_rows(&self, inputs: &[AttendeeInput]) -> Vec<NewAttendee> {
        let mut rows = Vec::with_capacity(inputs.len());
        for input in inputs {
            let user_id = match self.stores.users.get_by_email(&input.email).await {
                Ok(user) => user.map(|u| u.id),
                Err(e) => {
                    warn!(email = %input.email, error = %e, "user lookup failed, attendee left unlinked");
                    None
                }
            };
            rows.push(NewAttendee {
                email: input.email.clone(),
                full_name: input.full_name.clone(),
                user_id,
                status: AttendeeStatus::Pending,
            });
        }
        rows
    }

    /// One atomic unit when the backend has it; otherwise two writes with a
    /// compensating delete if the attendee insert fails.
    async fn write_new(
        &self,
        new: NewBooking,
        attendees: Vec<NewAttendee>,
        now: Ms,
    ) -> Result<(Booking, Vec<Attendee>), EngineError> {
        if let Some(done) = self
            .stores
            .bookings
            .create_atomic(new.clone(), attendees.clone(), now)
            .await?
        {
            return Ok(done);
        }

        let booking = self.stores.bookings.insert(new, now).await?;
        match self.stores.attendees.insert_many(booking.id, attendees).await {
            Ok(rows) => Ok((booking, rows)),
            Err(e) => {
                warn!(booking_id = %booking.id, error = %e, "attendee insert failed, removing orphaned booking");
                if let Err(cleanup) = self.stores.bookings.delete(booking.id).await {
                    warn!(booking_id = %booking.id, error = %cleanup, "orphaned booking cleanup failed");
                }
                Err(EngineError::Storage(e))
            }
        }
    }
}
