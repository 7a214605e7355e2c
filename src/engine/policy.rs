use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Source of "now" for policy checks, in the businesses' wall-clock time.
pub type Clock = fn() -> NaiveDateTime;

pub fn system_clock() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

// ── Booking policy ───────────────────────────────────────────────

pub(crate) fn check_booking_policy(
    settings: &ReservationSettings,
    date: NaiveDate,
    slot: &TimeSlot,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    if !settings.accept_reservations {
        return Err(EngineError::PolicyViolation("business is not accepting reservations"));
    }
    let starts_at = slot.starts_at(date);
    if starts_at <= now {
        return Err(EngineError::PolicyViolation("reservation starts in the past"));
    }
    if starts_at - now < Duration::minutes(i64::from(settings.min_advance_minutes)) {
        return Err(EngineError::PolicyViolation("reservation is inside the lead-time buffer"));
    }
    if date > now.date() + Duration::days(i64::from(settings.max_advance_days)) {
        return Err(EngineError::PolicyViolation("reservation is beyond the booking horizon"));
    }
    Ok(())
}

pub(crate) fn check_cancellation_policy(
    settings: &ReservationSettings,
    reservation: &Reservation,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    if settings.cancellation_window_minutes == 0 {
        return Ok(());
    }
    let window = Duration::minutes(i64::from(settings.cancellation_window_minutes));
    if reservation.starts_at() - now < window {
        return Err(EngineError::PolicyViolation("cancellation window has closed"));
    }
    Ok(())
}

// ── Write-time validation ────────────────────────────────────────

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_optional_text(
    text: Option<&str>,
    max: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Trim, lowercase, and check `local@domain.tld` shape.
pub(crate) fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = email.trim().to_lowercase();
    if email.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(EngineError::InvalidInput("malformed email"));
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let domain_ok = match domain.rsplit_once('.') {
        Some((host, tld)) => {
            !host.is_empty()
                && host
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
                && tld.len() >= 2
                && tld.chars().all(|c| c.is_ascii_alphabetic())
        }
        None => false,
    };
    if !local_ok || !domain_ok {
        return Err(EngineError::InvalidInput("malformed email"));
    }
    Ok(email)
}

/// Strip spaces and dashes; keep an optional leading `+` and 7-15 digits.
pub(crate) fn normalize_gsm(gsm: &str) -> Result<String, EngineError> {
    let cleaned: String = gsm.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if !(7..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(EngineError::InvalidInput("malformed phone number"));
    }
    Ok(cleaned)
}

pub(crate) fn validate_location(location: &Location) -> Result<(), EngineError> {
    if location.place_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("location place id must not be empty"));
    }
    if location.address.len() > MAX_ADDRESS_LEN {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    if location.latitude.is_some_and(|lat| !(-90.0..=90.0).contains(&lat))
        || location.longitude.is_some_and(|lon| !(-180.0..=180.0).contains(&lon))
    {
        return Err(EngineError::InvalidInput("coordinates out of range"));
    }
    Ok(())
}

pub(crate) fn validate_rule(def: &RuleDefinition) -> Result<(), EngineError> {
    if let AvailabilityKind::DateRange { start_date, end_date } = def.kind
        && start_date > end_date {
            return Err(EngineError::InvalidInput("date range starts after it ends"));
        }
    if def.windows.len() > MAX_WINDOWS_PER_RULE || def.blocked.len() > MAX_WINDOWS_PER_RULE {
        return Err(EngineError::LimitExceeded("too many windows on rule"));
    }
    if def
        .windows
        .iter()
        .chain(&def.blocked)
        .any(|w| TimeSlot::try_new(w.start, w.end).is_none())
    {
        return Err(EngineError::InvalidInput("time window must be non-empty and within the day"));
    }
    if def.open && def.windows.is_empty() {
        return Err(EngineError::InvalidInput("open rule needs at least one window"));
    }
    if !def.open && !def.windows.is_empty() {
        return Err(EngineError::InvalidInput("closed rule must not carry open windows"));
    }
    validate_optional_text(def.block_reason.as_deref(), MAX_REASON_LEN, "block reason too long")
}

pub(crate) fn validate_settings(s: &ReservationSettings) -> Result<(), EngineError> {
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&s.slot_duration_minutes) {
        return Err(EngineError::InvalidInput("slot duration out of range"));
    }
    if s.max_advance_days > MAX_ADVANCE_DAYS {
        return Err(EngineError::LimitExceeded("booking horizon too long"));
    }
    Ok(())
}
