use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Business rules for a candidate range. Order matters: a past start wins
/// over an inverted range, which wins over an excessive duration.
pub fn validate_range(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    if start <= now {
        return Err(EngineError::PastStart);
    }
    if end <= start {
        return Err(EngineError::InvertedRange);
    }
    if end - start > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::DurationExceeded);
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidField {
            field: "start_time",
            reason: "timestamp out of range",
        });
    }
    Ok(Span::new(start, end))
}

/// A draft that passed field validation.
#[derive(Debug, Clone)]
pub(crate) struct CheckedDraft {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    pub max_attendees: u32,
    pub attendees: Vec<AttendeeInput>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn check_len(
    value: &Option<String>,
    max: usize,
    field: &'static str,
) -> Result<(), EngineError> {
    if value.as_ref().is_some_and(|v| v.len() > max) {
        return Err(EngineError::InvalidField {
            field,
            reason: "too long",
        });
    }
    Ok(())
}

/// Field-level checks that run before the time-range validator.
/// Attendee rows missing an e-mail or a name are dropped, not rejected.
pub(crate) fn check_draft(draft: &BookingDraft) -> Result<CheckedDraft, EngineError> {
    let title = draft.title.trim().to_string();
    if title.is_empty() {
        return Err(EngineError::InvalidField {
            field: "title",
            reason: "required",
        });
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::InvalidField {
            field: "title",
            reason: "too long",
        });
    }

    let attendees: Vec<AttendeeInput> = draft
        .attendees
        .iter()
        .map(|a| AttendeeInput {
            email: a.email.trim().to_string(),
            full_name: a.full_name.trim().to_string(),
        })
        .filter(|a| !a.email.is_empty() && !a.full_name.is_empty())
        .collect();
    if attendees.is_empty() {
        return Err(EngineError::NoAttendees);
    }
    if attendees.len() > MAX_ATTENDEES_PER_BOOKING {
        return Err(EngineError::InvalidField {
            field: "attendees",
            reason: "too many attendees",
        });
    }
    for a in &attendees {
        if a.email.len() > MAX_EMAIL_LEN || !a.email.contains('@') {
            return Err(EngineError::InvalidField {
                field: "attendees.email",
                reason: "not an e-mail address",
            });
        }
        if a.full_name.len() > MAX_NAME_LEN {
            return Err(EngineError::InvalidField {
                field: "attendees.full_name",
                reason: "too long",
            });
        }
    }

    let max_attendees = draft.max_attendees.unwrap_or(DEFAULT_MAX_ATTENDEES);
    if max_attendees == 0 {
        return Err(EngineError::InvalidField {
            field: "max_attendees",
            reason: "must be at least 1",
        });
    }

    let description = non_blank(draft.description.clone());
    let location = non_blank(draft.location.clone());
    let meeting_link = non_blank(draft.meeting_link.clone());
    check_len(&description, MAX_DESCRIPTION_LEN, "description")?;
    check_len(&location, MAX_LOCATION_LEN, "location")?;
    check_len(&meeting_link, MAX_LINK_LEN, "meeting_link")?;
    if let Some(link) = &meeting_link
        && !(link.starts_with("https://") || link.starts_with("http://"))
    {
        return Err(EngineError::InvalidField {
            field: "meeting_link",
            reason: "must be an http(s) URL",
        });
    }

    Ok(CheckedDraft {
        title,
        description,
        location,
        meeting_link,
        max_attendees,
        attendees,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_750_000_000_000;
    const MIN: Ms = 60_000;

    fn draft() -> BookingDraft {
        BookingDraft {
            title: "Sync".into(),
            description: None,
            start: NOW + 60 * MIN,
            end: NOW + 90 * MIN,
            location: None,
            meeting_link: None,
            max_attendees: None,
            attendees: vec![AttendeeInput {
                email: "a@x.com".into(),
                full_name: "A".into(),
            }],
        }
    }

    #[test]
    fn accepts_valid_range() {
        let span = validate_range(NOW + MIN, NOW + 31 * MIN, NOW).unwrap();
        assert_eq!(span, Span::new(NOW + MIN, NOW + 31 * MIN));
    }

    #[test]
    fn start_at_now_is_past() {
        assert!(matches!(validate_range(NOW, NOW + MIN, NOW), Err(EngineError::PastStart)));
    }

    #[test]
    fn past_start_wins_over_other_failures() {
        // inverted and past
        assert!(matches!(
            validate_range(NOW - MIN, NOW - 2 * MIN, NOW),
            Err(EngineError::PastStart)
        ));
        // too long and past
        assert!(matches!(
            validate_range(NOW - MIN, NOW + 120 * MIN, NOW),
            Err(EngineError::PastStart)
        ));
    }

    #[test]
    fn zero_and_negative_duration_inverted() {
        let start = NOW + MIN;
        assert!(matches!(validate_range(start, start, NOW), Err(EngineError::InvertedRange)));
        assert!(matches!(
            validate_range(start, start - 1, NOW),
            Err(EngineError::InvertedRange)
        ));
    }

    #[test]
    fn duration_limit_is_inclusive() {
        let start = NOW + MIN;
        assert!(validate_range(start, start + MAX_BOOKING_DURATION_MS, NOW).is_ok());
        assert!(matches!(
            validate_range(start, start + MAX_BOOKING_DURATION_MS + 1, NOW),
            Err(EngineError::DurationExceeded)
        ));
    }

    #[test]
    fn sweep_of_ranges() {
        for offset in [-2 * MIN, -1, 0, 1, MIN, 24 * 60 * MIN] {
            for len in [-MIN, 0, 1, 30 * MIN, 60 * MIN, 61 * MIN] {
                let start = NOW + offset;
                let end = start + len;
                let result = validate_range(start, end, NOW);
                if start <= NOW {
                    assert!(matches!(result, Err(EngineError::PastStart)));
                } else if end <= start {
                    assert!(matches!(result, Err(EngineError::InvertedRange)));
                } else if len > MAX_BOOKING_DURATION_MS {
                    assert!(matches!(result, Err(EngineError::DurationExceeded)));
                } else {
                    assert!(result.is_ok(), "offset {offset} len {len}");
                }
            }
        }
    }

    #[test]
    fn draft_defaults_and_trimming() {
        let mut d = draft();
        d.title = "  Sync  ".into();
        d.location = Some("   ".into());
        let checked = check_draft(&d).unwrap();
        assert_eq!(checked.title, "Sync");
        assert_eq!(checked.location, None);
        assert_eq!(checked.max_attendees, DEFAULT_MAX_ATTENDEES);
    }

    #[test]
    fn blank_attendee_rows_are_dropped() {
        let mut d = draft();
        d.attendees.push(AttendeeInput {
            email: "".into(),
            full_name: "Nobody".into(),
        });
        d.attendees.push(AttendeeInput {
            email: "b@x.com".into(),
            full_name: " ".into(),
        });
        assert_eq!(check_draft(&d).unwrap().attendees.len(), 1);

        d.attendees.remove(0);
        assert!(matches!(check_draft(&d), Err(EngineError::NoAttendees)));
    }

    #[test]
    fn rejects_bad_fields() {
        let mut d = draft();
        d.title = " ".into();
        assert!(matches!(check_draft(&d), Err(EngineError::InvalidField { field: "title", .. })));

        let mut d = draft();
        d.max_attendees = Some(0);
        assert!(matches!(
            check_draft(&d),
            Err(EngineError::InvalidField { field: "max_attendees", .. })
        ));

        let mut d = draft();
        d.meeting_link = Some("ftp://files".into());
        assert!(matches!(
            check_draft(&d),
            Err(EngineError::InvalidField { field: "meeting_link", .. })
        ));

        let mut d = draft();
        d.attendees[0].email = "not-an-email".into();
        assert!(matches!(
            check_draft(&d),
            Err(EngineError::InvalidField { field: "attendees.email", .. })
        ));
    }
}
