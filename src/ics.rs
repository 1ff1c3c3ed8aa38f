//! RFC 5545 calendar invites attached to booking e-mails and exported over the wire.

use chrono::{DateTime, Utc};

use crate::model::{Attendee, Booking, Ms};

/// Maximum content line length in octets, excluding CRLF.
const MAX_LINE_OCTETS: usize = 75;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteConfig {
    /// Suffix of every UID: `<booking id>@<uid_domain>`.
    pub uid_domain: String,
    pub organizer_name: String,
    pub organizer_email: String,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            uid_domain: "kairos.local".into(),
            organizer_name: "Booking System".into(),
            organizer_email: "bookings@kairos.local".into(),
        }
    }
}

/// `YYYYMMDDTHHMMSSZ`
pub fn format_utc(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .format("%Y%m%dT%H%M%SZ")
        .to_string()
}

/// Escape a TEXT value: backslash, comma, semicolon and newline. CR is dropped.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Quote a parameter value when it holds a delimiter. Inside quotes,
/// caret encoding (RFC 6868) covers `^`, newline and `"`.
pub fn escape_param_value(s: &str) -> String {
    if !s.chars().any(|c| matches!(c, ':' | ';' | ',' | '"' | '\n')) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 8);
    out.push('"');
    for c in s.chars() {
        match c {
            '^' => out.push_str("^^"),
            '\n' => out.push_str("^n"),
            '"' => out.push_str("^'"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Fold one content line at 75 octets and terminate it with CRLF.
/// Continuation lines start with a space; UTF-8 sequences are never split.
pub fn fold_line(line: &str) -> String {
    if line.len() <= MAX_LINE_OCTETS {
        return format!("{line}\r\n");
    }

    let mut out = String::with_capacity(line.len() + (line.len() / MAX_LINE_OCTETS + 1) * 3);
    let mut rest = line;
    let mut first = true;
    while !rest.is_empty() {
        let budget = if first { MAX_LINE_OCTETS } else { MAX_LINE_OCTETS - 1 };
        let mut cut = budget.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // budget smaller than one char; take the whole char
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        if !first {
            out.push(' ');
        }
        out.push_str(&rest[..cut]);
        out.push_str("\r\n");
        rest = &rest[cut..];
        first = false;
    }
    out
}

/// Render a REQUEST invite for `booking` naming every attendee.
pub fn render_invite(config: &InviteConfig, booking: &Booking, attendees: &[Attendee], stamp: Ms) -> String {
    let description = booking
        .description
        .as_deref()
        .filter(|d| !d.is_empty())
        .unwrap_or("No description");
    let location = booking
        .location
        .as_deref()
        .filter(|l| !l.is_empty())
        .unwrap_or("TBA");

    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//Kairos//Booking System//EN".to_string(),
        "CALSCALE:GREGORIAN".to_string(),
        "METHOD:REQUEST".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}@{}", booking.id, config.uid_domain),
        format!("DTSTAMP:{}", format_utc(stamp)),
        format!("DTSTART:{}", format_utc(booking.span.start)),
        format!("DTEND:{}", format_utc(booking.span.end)),
        format!("SUMMARY:{}", escape_text(&booking.title)),
        format!("DESCRIPTION:{}", escape_text(description)),
        format!("LOCATION:{}", escape_text(location)),
        format!(
            "ORGANIZER;CN={}:mailto:{}",
            escape_param_value(&config.organizer_name),
            config.organizer_email
        ),
    ];
    for attendee in attendees {
        lines.push(format!(
            "ATTENDEE;CUTYPE=INDIVIDUAL;ROLE=REQ-PARTICIPANT;PARTSTAT=NEEDS-ACTION;RSVP=TRUE;CN={}:mailto:{}",
            escape_param_value(&attendee.full_name),
            attendee.email
        ));
    }
    lines.extend([
        "STATUS:CONFIRMED".to_string(),
        "SEQUENCE:0".to_string(),
        "TRANSP:OPAQUE".to_string(),
        "CLASS:PUBLIC".to_string(),
        "BEGIN:VALARM".to_string(),
        "TRIGGER:-PT30M".to_string(),
        "ACTION:DISPLAY".to_string(),
        format!("DESCRIPTION:Reminder: {}", escape_text(&booking.title)),
        "END:VALARM".to_string(),
        "END:VEVENT".to_string(),
        "END:VCALENDAR".to_string(),
    ]);

    lines.iter().map(|l| fold_line(l)).collect()
}
