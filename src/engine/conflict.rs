use chrono::{Datelike, NaiveDate, Utc};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if !(MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&date.year()) {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

/// Shape checks only: ordering, date bounds, length. No "past" check, so
/// calendar and audit reads can look backwards.
pub(crate) fn validate_window(start: NaiveDate, end_exclusive: NaiveDate, max_days: i64) -> Result<Stay, EngineError> {
    validate_date(start)?;
    validate_date(end_exclusive)?;
    let window = Stay::try_new(start, end_exclusive)
        .ok_or_else(|| EngineError::Validation(format!("range end {end_exclusive} must be after start {start}")))?;
    if window.nights() > max_days {
        return Err(EngineError::LimitExceeded("range too wide"));
    }
    Ok(window)
}

/// Full validation for a stay that is being checked or claimed.
pub(crate) fn validate_stay(stay: &Stay, today: NaiveDate, grace_days: u32) -> Result<(), EngineError> {
    if stay.check_out <= stay.check_in {
        return Err(EngineError::Validation(format!(
            "check_out {} must be after check_in {}",
            stay.check_out, stay.check_in
        )));
    }
    validate_window(stay.check_in, stay.check_out, MAX_STAY_NIGHTS)?;
    if !stay.is_valid(today, grace_days) {
        return Err(EngineError::Validation(format!(
            "check_in {} is too far in the past",
            stay.check_in
        )));
    }
    Ok(())
}

pub(crate) fn validate_requester(requester: &str) -> Result<(), EngineError> {
    if requester.is_empty() {
        return Err(EngineError::Validation("requester must not be empty".into()));
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::LimitExceeded("requester id too long"));
    }
    Ok(())
}

/// Every active record on the unit that overlaps `stay`: pending/confirmed
/// occupancies first, then (optionally) holds that are still blocking at `now`.
/// Lazily-expired holds are skipped here whether or not the sweep has run.
pub(crate) fn find_conflicts(
    us: &UnitState,
    stay: Stay,
    now: Ms,
    include_holds: bool,
) -> impl Iterator<Item = ConflictReason> {
    let occupied = us
        .overlapping_occupancies(stay)
        .filter(|o| o.state.is_active())
        .map(|o| ConflictReason::Occupied {
            occupancy_id: o.id,
            stay: o.stay,
        });
    let held = us
        .overlapping_holds(stay)
        .filter(move |h| include_holds && h.is_blocking(now))
        .map(|h| ConflictReason::Held {
            hold_id: h.id,
            stay: h.stay,
            expires_at: h.expires_at,
        });
    occupied.chain(held)
}

/// The write-time re-check. Runs under the unit's write lock so nothing can
/// slip in between this and the insert.
pub(crate) fn check_no_conflict(us: &UnitState, stay: Stay, now: Ms) -> Result<(), Vec<ConflictReason>> {
    let conflicts: Vec<_> = find_conflicts(us, stay, now, true).collect();
    if conflicts.is_empty() { Ok(()) } else { Err(conflicts) }
}
