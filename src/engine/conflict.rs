use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Reject `start >= end` and instants outside the supported range.
pub fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// Interval check for something that will actually occupy a calendar.
pub(crate) fn validate_booking_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_interval(start, end)?;
    if span.duration_ms() > MAX_APPOINTMENT_DURATION_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(span)
}

pub(crate) fn validate_offset(utc_offset: i32) -> Result<(), EngineError> {
    if utc_offset.abs() > MAX_UTC_OFFSET_SECS {
        return Err(EngineError::InvalidArgument("UTC offset out of range"));
    }
    Ok(())
}

/// The availability verdict: no confirmed appointment of this provider overlaps `span`.
/// Cancelled and pending rows never block.
pub fn is_free(ps: &ProviderState, span: &Span) -> bool {
    ps.confirmed_conflict(span).is_none()
}

/// Id of the confirmed appointment blocking `span`, if any.
pub(crate) fn find_conflict(ps: &ProviderState, span: &Span) -> Option<ulid::Ulid> {
    ps.confirmed_conflict(span).map(|a| a.id)
}

/// Re-validate a verdict taken under the read lock, now that the write lock is held.
/// `Ok(true)` confirms, `Ok(false)` waitlists. A slot seen free that has since been
/// confirmed by someone else is a lost race, not a waitlist.
pub(crate) fn revalidate(
    ps: &ProviderState,
    span: &Span,
    checked_free: bool,
    checked_version: u64,
) -> Result<bool, EngineError> {
    if ps.version == checked_version {
        return Ok(checked_free);
    }
    match find_conflict(ps, span) {
        None => Ok(true),
        Some(existing) if checked_free => Err(EngineError::Conflict(existing)),
        Some(_) => Ok(false),
    }
}
