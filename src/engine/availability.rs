use chrono::NaiveDate;

use crate::model::*;

use super::conflict::find_conflicts;

// ── Single-unit verdict ──────────────────────────────────────────

/// Availability of one unit for one stay. Stops at the first conflict; the
/// write path collects every conflict instead.
pub fn check(us: &UnitState, stay: Stay, now: Ms, include_holds: bool) -> Availability {
    let unit_id = us.unit.id;
    if !us.unit.active {
        return Availability::unavailable(unit_id, stay, Unavailable::UnitInactive);
    }
    match find_conflicts(us, stay, now, include_holds).next() {
        Some(conflict) => Availability::unavailable(unit_id, stay, Unavailable::Conflicts(vec![conflict])),
        None => Availability::available(unit_id, stay),
    }
}

/// Claims that block the unit at `now` and overlap `window`, sorted by check-in.
fn active_claims(us: &UnitState, window: Stay, now: Ms) -> Vec<(Stay, ClaimRef)> {
    let mut claims: Vec<(Stay, ClaimRef)> = us
        .overlapping_occupancies(window)
        .filter(|o| o.state.is_active())
        .map(|o| (o.stay, ClaimRef::Occupancy(o.id)))
        .chain(
            us.overlapping_holds(window)
                .filter(|h| h.is_blocking(now))
                .map(|h| (h.stay, ClaimRef::Hold(h.id))),
        )
        .collect();
    claims.sort_by_key(|(stay, _)| stay.check_in);
    claims
}

// ── Calendar grid ────────────────────────────────────────────────

/// One entry per day of `window` (half-open, so callers asking for an
/// inclusive end pass `end + 1`). A day is occupied when an active claim
/// contains it; check-in/check-out flags mark turnover days, which can stay
/// available.
pub fn calendar_grid(us: &UnitState, window: Stay, now: Ms) -> Vec<CalendarDay> {
    let mut grid: Vec<CalendarDay> = window
        .days()
        .map(|date| CalendarDay {
            date,
            is_available: us.unit.active,
            has_check_in: false,
            has_check_out: false,
            occupancy_ref: None,
        })
        .collect();

    // Widen by a day on the left so claims checking out on the first day are seen.
    let probe = Stay {
        check_in: window.check_in.pred_opt().unwrap_or(window.check_in),
        check_out: window.check_out,
    };

    for (stay, claim) in active_claims(us, probe, now) {
        let from = stay.check_in.max(window.check_in);
        let to = stay.check_out.min(window.check_out);
        if let Some(clipped) = Stay::try_new(from, to) {
            for day in clipped.days() {
                let cell = &mut grid[day_index(&window, day)];
                cell.is_available = false;
                cell.occupancy_ref.get_or_insert(claim);
            }
        }
        if window.contains_day(stay.check_in) {
            grid[day_index(&window, stay.check_in)].has_check_in = true;
        }
        if window.contains_day(stay.check_out) {
            grid[day_index(&window, stay.check_out)].has_check_out = true;
        }
    }

    grid
}

fn day_index(window: &Stay, day: NaiveDate) -> usize {
    day.signed_duration_since(window.check_in).num_days() as usize
}

// ── Available periods ────────────────────────────────────────────

/// Merge runs of available days into periods, in chronological order.
/// `window_end` is the exclusive end of the grid, used to close a trailing run.
pub fn available_periods(grid: &[CalendarDay], window_end: NaiveDate, min_stay_nights: u32) -> Vec<AvailablePeriod> {
    let period = |start: NaiveDate, end: NaiveDate| {
        let nights = end.signed_duration_since(start).num_days();
        AvailablePeriod {
            start,
            end,
            meets_min_stay: nights >= i64::from(min_stay_nights),
        }
    };

    let mut periods = Vec::new();
    let mut run_start: Option<NaiveDate> = None;
    for day in grid {
        match (day.is_available, run_start) {
            (true, None) => run_start = Some(day.date),
            (false, Some(start)) => {
                periods.push(period(start, day.date));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        periods.push(period(start, window_end));
    }
    periods
}

/// Free stays inside `window` by interval subtraction, without building a grid.
pub fn free_stays(us: &UnitState, window: Stay, now: Ms) -> Vec<Stay> {
    if !us.unit.active {
        return Vec::new();
    }
    let claims: Vec<Stay> = active_claims(us, window, now)
        .into_iter()
        .map(|(stay, _)| stay)
        .collect();
    subtract_stays(&[window], &merge_stays(&claims))
}

/// Merge sorted overlapping/adjacent stays into disjoint stays.
pub fn merge_stays(sorted: &[Stay]) -> Vec<Stay> {
    let mut merged: Vec<Stay> = Vec::new();
    for &stay in sorted {
        if let Some(last) = merged.last_mut()
            && stay.check_in <= last.check_out
        {
            last.check_out = last.check_out.max(stay.check_out);
            continue;
        }
        merged.push(stay);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_stays(base: &[Stay], to_remove: &[Stay]) -> Vec<Stay> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current = b.check_in;
        let end = b.check_out;

        while ri < to_remove.len() && to_remove[ri].check_out <= current {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].check_in < end {
            let r = &to_remove[j];
            if r.check_in > current {
                result.push(Stay::new(current, r.check_in));
            }
            current = current.max(r.check_out);
            j += 1;
        }

        if current < end {
            result.push(Stay::new(current, end));
        }
    }

    result
}
