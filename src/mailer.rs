use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ics::{self, InviteConfig};
use crate::model::{Attendee, Booking, Ms, NotificationKind};

/// Outcome of one notification fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyReport {
    pub success: bool,
    pub detail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("email service not configured")]
    NotConfigured,
    #[error("email request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("email API returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Sends booking notices to attendees. Never fails: problems are in the report.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, kind: NotificationKind, booking: &Booking, attendees: &[Attendee]) -> NotifyReport;
}

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub from: String,
    pub timezone: Tz,
    pub invite: InviteConfig,
}

/// Transactional e-mail over a Resend-style HTTP API (`POST {api}/emails`).
pub struct EmailNotifier {
    client: Client,
    settings: EmailSettings,
}

#[derive(Serialize)]
struct Attachment {
    filename: &'static str,
    content: String,
}

#[derive(Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    html: String,
    attachments: Vec<Attachment>,
}

fn subject(kind: NotificationKind, title: &str) -> String {
    let prefix = match kind {
        NotificationKind::Created => "Invitation",
        NotificationKind::Updated => "Updated",
        NotificationKind::Cancelled => "Cancelled",
    };
    format!("{prefix}: {title}")
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn local_time(ms: Ms, tz: Tz) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(&tz)
        .format("%A, %B %-d, %Y at %-I:%M %p %Z")
        .to_string()
}

fn render_body(kind: NotificationKind, booking: &Booking, recipient: &Attendee, tz: Tz) -> String {
    let lead = match kind {
        NotificationKind::Created => "You have been invited to a meeting.",
        NotificationKind::Updated => "A meeting you are invited to has been updated.",
        NotificationKind::Cancelled => "A meeting you were invited to has been cancelled.",
    };
    let mut html = format!(
        "<h2>{}</h2><p>Hi {},</p><p>{lead}</p>",
        html_escape(&booking.title),
        html_escape(&recipient.full_name),
    );
    if let Some(description) = &booking.description {
        html.push_str(&format!("<p>{}</p>", html_escape(description)));
    }
    html.push_str(&format!(
        "<p><strong>Starts:</strong> {}<br><strong>Ends:</strong> {}</p>",
        local_time(booking.span.start, tz),
        local_time(booking.span.end, tz),
    ));
    if let Some(location) = &booking.location {
        html.push_str(&format!("<p><strong>Location:</strong> {}</p>", html_escape(location)));
    }
    if kind != NotificationKind::Cancelled
        && let Some(link) = &booking.meeting_link
    {
        let link = html_escape(link);
        html.push_str(&format!("<p><a href=\"{link}\">Join meeting</a></p>"));
    }
    html
}

impl EmailNotifier {
    pub fn new(settings: EmailSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    async fn send_one(
        &self,
        kind: NotificationKind,
        booking: &Booking,
        recipient: &Attendee,
        stamp: Ms,
    ) -> Result<(), NotifyError> {
        let api_key = self.settings.api_key.as_deref().ok_or(NotifyError::NotConfigured)?;
        let invite = ics::render_invite(&self.settings.invite, booking, std::slice::from_ref(recipient), stamp);
        let request = EmailRequest {
            from: &self.settings.from,
            to: vec![recipient.email.as_str()],
            subject: subject(kind, &booking.title),
            html: render_body(kind, booking, recipient, self.settings.timezone),
            attachments: vec![Attachment {
                filename: "invite.ics",
                content: BASE64.encode(invite.as_bytes()),
            }],
        };

        let url = format!("{}/emails", self.settings.api_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(NotifyError::Status { status, body });
        }
        debug!(booking_id = %booking.id, to = %recipient.email, "email sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, kind: NotificationKind, booking: &Booking, attendees: &[Attendee]) -> NotifyReport {
        if self.settings.api_key.is_none() {
            return NotifyReport {
                success: false,
                detail: NotifyError::NotConfigured.to_string(),
            };
        }
        let stamp = chrono::Utc::now().timestamp_millis();
        let results =
            futures::future::join_all(attendees.iter().map(|a| self.send_one(kind, booking, a, stamp))).await;

        let mut sent = 0;
        for (attendee, result) in attendees.iter().zip(results) {
            match result {
                Ok(()) => sent += 1,
                Err(e) => warn!(booking_id = %booking.id, to = %attendee.email, error = %e, "email failed"),
            }
        }
        NotifyReport {
            success: sent == attendees.len(),
            detail: format!("{sent}/{} emails sent", attendees.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn booking() -> Booking {
        Booking {
            id: Ulid::new(),
            title: "Design <review>".into(),
            description: Some("Walk through the draft".into()),
            span: Span::new(1_749_992_400_000, 1_749_994_200_000),
            location: Some("Room 4".into()),
            meeting_link: Some("https://meet.example.com/abc".into()),
            max_attendees: 10,
            status: BookingStatus::Scheduled,
            created_by: Ulid::new(),
            created_at: 0,
            updated_at: 0,
            calendar_event_id: None,
        }
    }

    fn attendee(booking_id: Ulid, email: &str) -> Attendee {
        Attendee {
            id: Ulid::new(),
            booking_id,
            email: email.into(),
            full_name: "Ada".into(),
            user_id: None,
            status: AttendeeStatus::Pending,
        }
    }

    fn notifier(api_url: String, api_key: Option<&str>) -> EmailNotifier {
        EmailNotifier::new(EmailSettings {
            api_url,
            api_key: api_key.map(String::from),
            from: "Booking System <onboarding@resend.dev>".into(),
            timezone: chrono_tz::UTC,
            invite: InviteConfig::default(),
        })
    }

    #[test]
    fn subjects_by_kind() {
        assert_eq!(subject(NotificationKind::Created, "Sync"), "Invitation: Sync");
        assert_eq!(subject(NotificationKind::Updated, "Sync"), "Updated: Sync");
        assert_eq!(subject(NotificationKind::Cancelled, "Sync"), "Cancelled: Sync");
    }

    #[test]
    fn body_escapes_and_hides_link_on_cancel() {
        let b = booking();
        let a = attendee(b.id, "a@x.com");
        let created = render_body(NotificationKind::Created, &b, &a, chrono_tz::UTC);
        assert!(created.contains("Design &lt;review&gt;"));
        assert!(created.contains("Join meeting"));
        assert!(created.contains("Sunday, June 15, 2025 at 1:00 PM UTC"));

        let cancelled = render_body(NotificationKind::Cancelled, &b, &a, chrono_tz::UTC);
        assert!(!cancelled.contains("Join meeting"));
    }

    #[tokio::test]
    async fn sends_one_email_per_attendee() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("Authorization", "Bearer re_test"))
            .and(body_partial_json(serde_json::json!({
                "subject": "Invitation: Design <review>",
                "attachments": [{ "filename": "invite.ics" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "em_1" })))
            .expect(2)
            .mount(&server)
            .await;

        let b = booking();
        let attendees = vec![attendee(b.id, "a@x.com"), attendee(b.id, "b@x.com")];
        let report = notifier(server.uri(), Some("re_test"))
            .send(NotificationKind::Created, &b, &attendees)
            .await;
        assert!(report.success);
        assert_eq!(report.detail, "2/2 emails sent");
    }

    #[tokio::test]
    async fn partial_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(body_partial_json(serde_json::json!({ "to": ["bad@x.com"] })))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid recipient"))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let b = booking();
        let attendees = vec![attendee(b.id, "a@x.com"), attendee(b.id, "bad@x.com")];
        let report = notifier(server.uri(), Some("re_test"))
            .send(NotificationKind::Updated, &b, &attendees)
            .await;
        assert!(!report.success);
        assert_eq!(report.detail, "1/2 emails sent");
    }

    #[tokio::test]
    async fn missing_api_key_reports_failure() {
        let b = booking();
        let report = notifier("http://127.0.0.1:9".into(), None)
            .send(NotificationKind::Created, &b, &[attendee(b.id, "a@x.com")])
            .await;
        assert!(!report.success);
        assert_eq!(report.detail, "email service not configured");
    }
}
