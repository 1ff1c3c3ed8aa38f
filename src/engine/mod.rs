mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod validate;

pub use availability::{is_within_availability, merge_overlapping, open_slots, subtract_intervals, window_contains};
pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use validate::validate_range;

pub(crate) use conflict::now_ms;

use std::sync::Arc;

use chrono_tz::Tz;

use crate::dispatch::{Dispatcher, Job};
use crate::ics::InviteConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::Stores;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Zone that defines "today" for dashboard stats.
    pub timezone: Tz,
    pub invite: InviteConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            invite: InviteConfig::default(),
        }
    }
}

/// The booking orchestrator. Every operation takes the acting principal
/// explicitly; there is no ambient session.
pub struct Engine {
    pub(crate) stores: Stores,
    pub(crate) dispatcher: Dispatcher,
    pub notify: Arc<NotifyHub>,
    pub(crate) settings: EngineSettings,
}

impl Engine {
    pub fn new(
        stores: Stores,
        dispatcher: Dispatcher,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            stores,
            dispatcher,
            notify,
            settings,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Publish on the hub and queue the side effects of a write. Never waits on them.
    pub(super) fn fan_out(&self, event: BookingEvent, jobs: Vec<Job>) {
        self.notify.send(&event);
        for job in jobs {
            self.dispatcher.submit(job);
        }
    }
}

pub(super) fn ensure_owner(principal: &Principal, booking: &Booking) -> Result<(), EngineError> {
    if booking.created_by != principal.id {
        return Err(EngineError::NotOwner);
    }
    Ok(())
}

pub(super) fn ensure_admin(principal: &Principal) -> Result<(), EngineError> {
    if !principal.role.is_admin() {
        return Err(EngineError::AdminOnly);
    }
    Ok(())
}
