use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Attendee, Booking, Ms};

pub const GOOGLE_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("calendar request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("calendar API returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Mirrors bookings into the user's external calendar. Every call is a
/// no-op returning `None` when there is no access token.
#[async_trait]
pub trait CalendarSync: Send + Sync {
    async fn create_event(
        &self,
        token: Option<&str>,
        booking: &Booking,
        attendees: &[Attendee],
    ) -> Result<Option<String>, CalendarError>;

    async fn update_event(
        &self,
        token: Option<&str>,
        event_id: &str,
        booking: &Booking,
        attendees: &[Attendee],
    ) -> Result<Option<String>, CalendarError>;

    async fn delete_event(&self, token: Option<&str>, event_id: &str) -> Result<(), CalendarError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    date_time: String,
    time_zone: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventAttendee {
    email: String,
    display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryPoint {
    entry_point_type: &'static str,
    uri: String,
    label: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConferenceData {
    entry_points: Vec<EntryPoint>,
}

#[derive(Debug, Serialize)]
struct ReminderOverride {
    method: &'static str,
    minutes: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Reminders {
    use_default: bool,
    overrides: Vec<ReminderOverride>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload {
    summary: String,
    description: String,
    location: String,
    start: EventTime,
    end: EventTime,
    attendees: Vec<EventAttendee>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conference_data: Option<ConferenceData>,
    reminders: Reminders,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    id: String,
}

/// Google Calendar v3 against the `primary` calendar. Attendees are not
/// e-mailed by the provider (`sendUpdates=none`); our own mailer does that.
pub struct GoogleCalendar {
    client: Client,
    base_url: String,
    timezone: Tz,
}

impl GoogleCalendar {
    pub fn new(base_url: impl Into<String>, timezone: Tz) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timezone,
        }
    }

    fn events_url(&self) -> String {
        format!("{}/calendars/primary/events", self.base_url)
    }

    fn event_time(&self, ms: Ms) -> EventTime {
        EventTime {
            date_time: DateTime::<Utc>::from_timestamp_millis(ms)
                .unwrap_or_default()
                .with_timezone(&self.timezone)
                .to_rfc3339_opts(SecondsFormat::Secs, false),
            time_zone: self.timezone.name().to_string(),
        }
    }

    fn payload(&self, booking: &Booking, attendees: &[Attendee]) -> EventPayload {
        EventPayload {
            summary: booking.title.clone(),
            description: booking.description.clone().unwrap_or_default(),
            location: booking.location.clone().unwrap_or_default(),
            start: self.event_time(booking.span.start),
            end: self.event_time(booking.span.end),
            attendees: attendees
                .iter()
                .map(|a| EventAttendee {
                    email: a.email.clone(),
                    display_name: a.full_name.clone(),
                })
                .collect(),
            conference_data: booking.meeting_link.as_ref().map(|link| ConferenceData {
                entry_points: vec![EntryPoint {
                    entry_point_type: "video",
                    uri: link.clone(),
                    label: link.clone(),
                }],
            }),
            reminders: Reminders {
                use_default: false,
                overrides: vec![ReminderOverride {
                    method: "popup",
                    minutes: 30,
                }],
            },
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CalendarError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
        Err(CalendarError::Status { status, body })
    }
}

#[async_trait]
impl CalendarSync for GoogleCalendar {
    async fn create_event(
        &self,
        token: Option<&str>,
        booking: &Booking,
        attendees: &[Attendee],
    ) -> Result<Option<String>, CalendarError> {
        let Some(token) = token else {
            return Ok(None);
        };
        let response = self
            .client
            .post(self.events_url())
            .query(&[("sendUpdates", "none")])
            .bearer_auth(token)
            .json(&self.payload(booking, attendees))
            .send()
            .await?;
        let event: EventResponse = Self::check(response).await?.json().await?;
        debug!(booking_id = %booking.id, event_id = %event.id, "calendar event created");
        Ok(Some(event.id))
    }

    async fn update_event(
        &self,
        token: Option<&str>,
        event_id: &str,
        booking: &Booking,
        attendees: &[Attendee],
    ) -> Result<Option<String>, CalendarError> {
        let Some(token) = token else {
            return Ok(None);
        };
        let response = self
            .client
            .put(format!("{}/{}", self.events_url(), event_id))
            .query(&[("sendUpdates", "none")])
            .bearer_auth(token)
            .json(&self.payload(booking, attendees))
            .send()
            .await?;
        let event: EventResponse = Self::check(response).await?.json().await?;
        Ok(Some(event.id))
    }

    async fn delete_event(&self, token: Option<&str>, event_id: &str) -> Result<(), CalendarError> {
        let Some(token) = token else {
            return Ok(());
        };
        let response = self
            .client
            .delete(format!("{}/{}", self.events_url(), event_id))
            .query(&[("sendUpdates", "none")])
            .bearer_auth(token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
