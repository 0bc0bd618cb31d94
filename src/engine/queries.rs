use std::collections::HashMap;

use chrono::{Days, NaiveDate};
use tracing::debug;
use ulid::Ulid;

use crate::cache::CacheKey;
use crate::limits::*;
use crate::model::*;

use super::availability;
use super::conflict::{now_ms, today, validate_stay, validate_window};
use super::{Engine, EngineError};

/// How an availability check may be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOptions {
    /// Count live holds as conflicts.
    pub include_holds: bool,
    /// Allow a recent cached verdict. Advisory reads only; never for writes.
    pub use_cache: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            include_holds: true,
            use_cache: false,
        }
    }
}

impl CheckOptions {
    /// High-volume display reads (search, chat, admin grids).
    pub fn cached() -> Self {
        Self {
            include_holds: true,
            use_cache: true,
        }
    }
}

impl Engine {
    pub async fn get_unit(&self, id: Ulid) -> Result<Unit, EngineError> {
        let guard = self.lock_unit_read(id).await?;
        Ok(guard.unit.clone())
    }

    pub async fn list_units(&self) -> Vec<Unit> {
        let mut units = Vec::new();
        for id in self.store.unit_ids() {
            if let Some(us) = self.store.get_unit(&id) {
                let unit = us.read().await.unit.clone();
                if self.store.is_current(&id, &us) {
                    units.push(unit);
                }
            }
        }
        units.sort_by_key(|u| u.id);
        units
    }

    /// Is the unit free for `stay`? Validation happens before any data access;
    /// an unknown unit is `NotFound`, never "available".
    pub async fn check_availability(
        &self,
        unit_id: Ulid,
        stay: Stay,
        opts: CheckOptions,
    ) -> Result<Availability, EngineError> {
        validate_stay(&stay, today(), self.config.grace_days)?;
        let now = now_ms();
        let key = CacheKey {
            unit_id,
            stay,
            include_holds: opts.include_holds,
        };
        if opts.use_cache
            && let Some(hit) = self.cache.get(&key, now)
        {
            return Ok(hit);
        }

        let guard = self.lock_unit_read(unit_id).await?;
        let verdict = availability::check(&guard, stay, now, opts.include_holds);
        // Store before releasing the read lock: a writer invalidates under the
        // write lock, so it cannot slip in between compute and put.
        if opts.use_cache {
            self.cache.put(key, verdict.clone(), self.cache.ttl_ms(), now);
        }
        drop(guard);

        if !verdict.available {
            debug!("unit {unit_id} unavailable for {stay}");
        }
        Ok(verdict)
    }

    /// One verdict per distinct unit id, all evaluated against the same `now`.
    /// Unknown units map to a `NotFound` entry.
    pub async fn check_bulk_availability(
        &self,
        unit_ids: &[Ulid],
        stay: Stay,
        opts: CheckOptions,
    ) -> Result<HashMap<Ulid, Result<Availability, EngineError>>, EngineError> {
        if unit_ids.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many units in one check"));
        }
        validate_stay(&stay, today(), self.config.grace_days)?;
        let now = now_ms();

        let mut results = HashMap::with_capacity(unit_ids.len());
        for &unit_id in unit_ids {
            if results.contains_key(&unit_id) {
                continue;
            }
            let key = CacheKey {
                unit_id,
                stay,
                include_holds: opts.include_holds,
            };
            if opts.use_cache
                && let Some(hit) = self.cache.get(&key, now)
            {
                results.insert(unit_id, Ok(hit));
                continue;
            }
            let verdict = match self.lock_unit_read(unit_id).await {
                Ok(guard) => {
                    let verdict = availability::check(&guard, stay, now, opts.include_holds);
                    if opts.use_cache {
                        self.cache.put(key, verdict.clone(), self.cache.ttl_ms(), now);
                    }
                    Ok(verdict)
                }
                Err(e) => Err(e),
            };
            results.insert(unit_id, verdict);
        }
        Ok(results)
    }

    /// Day-by-day projection over the inclusive range `[start, end]`.
    pub async fn calendar_grid(
        &self,
        unit_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CalendarDay>, EngineError> {
        let window = inclusive_window(start, end)?;
        let guard = self.lock_unit_read(unit_id).await?;
        Ok(availability::calendar_grid(&guard, window, now_ms()))
    }

    /// Free periods inside the inclusive range `[start, end]`, each flagged
    /// against `min_stay_nights`.
    pub async fn find_available_periods(
        &self,
        unit_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        min_stay_nights: u32,
    ) -> Result<Vec<AvailablePeriod>, EngineError> {
        let window = inclusive_window(start, end)?;
        let guard = self.lock_unit_read(unit_id).await?;
        let grid = availability::calendar_grid(&guard, window, now_ms());
        Ok(availability::available_periods(&grid, window.check_out, min_stay_nights))
    }

    /// First stay of `nights` nights starting on or after `from` that is free,
    /// searching up to a year ahead.
    pub async fn next_available_window(
        &self,
        unit_id: Ulid,
        nights: i64,
        from: NaiveDate,
    ) -> Result<Option<Stay>, EngineError> {
        if !(1..=MAX_STAY_NIGHTS).contains(&nights) {
            return Err(EngineError::Validation(format!("nights must be in 1..={MAX_STAY_NIGHTS}")));
        }
        let horizon_end = from
            .checked_add_days(Days::new(NEXT_WINDOW_HORIZON_DAYS))
            .ok_or(EngineError::LimitExceeded("date out of range"))?;
        let window = validate_window(from, horizon_end, NEXT_WINDOW_HORIZON_DAYS as i64)?;
        let guard = self.lock_unit_read(unit_id).await?;
        let free = availability::free_stays(&guard, window, now_ms());
        Ok(free
            .into_iter()
            .find(|s| s.nights() >= nights)
            .and_then(|s| s.check_in.checked_add_days(Days::new(nights as u64)).map(|out| Stay::new(s.check_in, out))))
    }

    pub async fn get_occupancy(&self, id: Ulid) -> Result<Occupancy, EngineError> {
        let guard = self.resolve_entity_read(&id).await?;
        guard.occupancy(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Pending and confirmed occupancies, ordered by check-in.
    pub async fn list_active_occupancies(&self, unit_id: Ulid) -> Result<Vec<Occupancy>, EngineError> {
        let guard = self.lock_unit_read(unit_id).await?;
        Ok(guard
            .occupancies
            .iter()
            .filter(|o| o.state.is_active())
            .cloned()
            .collect())
    }

    /// Every occupancy including cancelled ones (audit view), ordered by check-in.
    pub async fn list_occupancies(&self, unit_id: Ulid) -> Result<Vec<Occupancy>, EngineError> {
        let guard = self.lock_unit_read(unit_id).await?;
        Ok(guard.occupancies.clone())
    }

    pub async fn get_hold(&self, id: Ulid) -> Result<Hold, EngineError> {
        let guard = self.resolve_entity_read(&id).await.map_err(|e| match e {
            EngineError::NotFound(_) => EngineError::HoldNotFound(id),
            other => other,
        })?;
        guard.hold(id).cloned().ok_or(EngineError::HoldNotFound(id))
    }

    /// Holds in every state, ordered by check-in. Lapsed holds the sweep has
    /// not reached yet are reported as expired.
    pub async fn list_holds(&self, unit_id: Ulid) -> Result<Vec<Hold>, EngineError> {
        let guard = self.lock_unit_read(unit_id).await?;
        let now = now_ms();
        Ok(guard
            .holds
            .iter()
            .map(|h| {
                let mut h = h.clone();
                if h.state == HoldState::Active && !h.is_blocking(now) {
                    h.state = HoldState::Expired;
                }
                h
            })
            .collect())
    }
}

fn inclusive_window(start: NaiveDate, end: NaiveDate) -> Result<Stay, EngineError> {
    if end < start {
        return Err(EngineError::Validation(format!("end {end} is before start {start}")));
    }
    let end_exclusive = end
        .succ_opt()
        .ok_or(EngineError::LimitExceeded("date out of range"))?;
    validate_window(start, end_exclusive, MAX_QUERY_DAYS)
}
