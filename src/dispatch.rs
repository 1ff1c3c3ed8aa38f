use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar::CalendarSync;
use crate::mailer::{Notifier, NotifyReport};
use crate::model::{Attendee, Booking, BookingEvent, NotificationKind};
use crate::notify::NotifyHub;
use crate::observability::{DISPATCH_DROPPED_TOTAL, DISPATCH_JOBS_TOTAL};
use crate::store::{BookingStore, StoreError, UserStore};

/// A side effect of a committed booking write.
#[derive(Debug)]
pub enum Job {
    Notify {
        kind: NotificationKind,
        booking: Booking,
        attendees: Vec<Attendee>,
    },
    CalendarCreate {
        booking: Booking,
        attendees: Vec<Attendee>,
        token: String,
    },
    CalendarUpdate {
        booking: Booking,
        attendees: Vec<Attendee>,
        token: String,
    },
    CalendarDelete {
        booking_id: Ulid,
        event_id: String,
        token: String,
        /// Clear the stored event reference afterwards (false when the booking is gone).
        clear_ref: bool,
    },
    /// Resolved once every job queued before it has been processed.
    Flush(oneshot::Sender<()>),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Notify { .. } => "notify",
            Job::CalendarCreate { .. } => "calendar_create",
            Job::CalendarUpdate { .. } => "calendar_update",
            Job::CalendarDelete { .. } => "calendar_delete",
            Job::Flush(_) => "flush",
        }
    }
}

/// Handle for queueing side effects. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    /// Start the worker. It runs until every `Dispatcher` clone is dropped.
    pub fn spawn(worker: DispatchWorker, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx }, handle)
    }

    /// Queue a job without waiting. A full or closed queue drops it.
    pub fn submit(&self, job: Job) -> bool {
        let kind = job.kind();
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(kind, "dispatch queue full, side effect dropped");
                metrics::counter!(DISPATCH_DROPPED_TOTAL, "kind" => kind).increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(kind, "dispatcher stopped, side effect dropped");
                metrics::counter!(DISPATCH_DROPPED_TOTAL, "kind" => kind).increment(1);
                false
            }
        }
    }

    /// Wait until everything queued so far has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Job::Flush(tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// Processes jobs one at a time. Failures are logged and counted, never retried.
pub struct DispatchWorker {
    pub notifier: Arc<dyn Notifier>,
    pub calendar: Arc<dyn CalendarSync>,
    pub users: Arc<dyn UserStore>,
    pub bookings: Arc<dyn BookingStore>,
    pub notify: Arc<NotifyHub>,
    /// Skip e-mail for bookings created by privileged roles.
    pub skip_privileged: bool,
}

fn outcome(kind: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::counter!(DISPATCH_JOBS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
}

impl DispatchWorker {
    async fn run(self, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            self.process(job).await;
        }
        debug!("dispatch worker stopped");
    }

    async fn process(&self, job: Job) {
        match job {
            Job::Notify {
                kind,
                booking,
                attendees,
            } => self.notify_attendees(kind, &booking, &attendees).await,
            Job::CalendarCreate {
                booking,
                attendees,
                token,
            } => self.calendar_create(&booking, &attendees, &token).await,
            Job::CalendarUpdate {
                booking,
                attendees,
                token,
            } => self.calendar_update(&booking, &attendees, &token).await,
            Job::CalendarDelete {
                booking_id,
                event_id,
                token,
                clear_ref,
            } => self.calendar_delete(booking_id, &event_id, &token, clear_ref).await,
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn suppressed(&self, booking: &Booking) -> bool {
        if !self.skip_privileged {
            return false;
        }
        match self.users.get_by_id(booking.created_by).await {
            Ok(Some(user)) => user.role.is_privileged(),
            Ok(None) => false,
            Err(e) => {
                warn!(booking_id = %booking.id, error = %e, "creator lookup failed, sending notification");
                false
            }
        }
    }

    async fn notify_attendees(&self, kind: NotificationKind, booking: &Booking, attendees: &[Attendee]) {
        let report = if self.suppressed(booking).await {
            info!(booking_id = %booking.id, kind = kind.as_str(), "notification skipped for privileged creator");
            NotifyReport {
                success: true,
                detail: "skipped".into(),
            }
        } else {
            self.notifier.send(kind, booking, attendees).await
        };

        if report.success {
            info!(booking_id = %booking.id, kind = kind.as_str(), detail = %report.detail, "notification sent");
        } else {
            warn!(booking_id = %booking.id, kind = kind.as_str(), detail = %report.detail, "notification failed");
        }
        outcome("notify", report.success);
        self.notify.send(&BookingEvent::NotificationSent {
            booking_id: booking.id,
            kind,
            success: report.success,
            detail: report.detail,
        });
    }

    async fn calendar_create(&self, booking: &Booking, attendees: &[Attendee], token: &str) {
        match self.calendar.create_event(Some(token), booking, attendees).await {
            Ok(Some(event_id)) => {
                outcome("calendar_create", true);
                self.record_ref(booking.id, Some(event_id)).await;
            }
            Ok(None) => outcome("calendar_create", true),
            Err(e) => {
                outcome("calendar_create", false);
                warn!(booking_id = %booking.id, error = %e, "calendar create failed");
            }
        }
    }

    /// The reference is read at processing time: a create queued just
    /// before this job has recorded it by now.
    async fn calendar_update(&self, booking: &Booking, attendees: &[Attendee], token: &str) {
        let current = match self.bookings.get(booking.id).await {
            Ok(Some(b)) => b.calendar_event_id,
            Ok(None) => None,
            Err(e) => {
                warn!(booking_id = %booking.id, error = %e, "calendar reference lookup failed");
                None
            }
        };
        let Some(event_id) = current else {
            debug!(booking_id = %booking.id, "no calendar event to update");
            return;
        };
        match self.calendar.update_event(Some(token), &event_id, booking, attendees).await {
            Ok(Some(updated)) => {
                outcome("calendar_update", true);
                if updated != event_id {
                    self.record_ref(booking.id, Some(updated)).await;
                }
            }
            Ok(None) => outcome("calendar_update", true),
            Err(e) => {
                outcome("calendar_update", false);
                warn!(booking_id = %booking.id, event_id = %event_id, error = %e, "calendar update failed");
            }
        }
    }

    async fn calendar_delete(&self, booking_id: Ulid, event_id: &str, token: &str, clear_ref: bool) {
        match self.calendar.delete_event(Some(token), event_id).await {
            Ok(()) => {
                outcome("calendar_delete", true);
                if clear_ref {
                    self.record_ref(booking_id, None).await;
                }
            }
            Err(e) => {
                outcome("calendar_delete", false);
                warn!(booking_id = %booking_id, event_id, error = %e, "calendar delete failed");
            }
        }
    }

    async fn record_ref(&self, booking_id: Ulid, event_id: Option<String>) {
        match self.bookings.set_calendar_ref(booking_id, event_id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!(booking_id = %booking_id, error = %e, "could not record calendar reference"),
        }
    }
}
