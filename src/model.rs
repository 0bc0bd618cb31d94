use std::fmt;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type. Calendar days are `NaiveDate`.
pub type Ms = i64;

/// Money in minor currency units.
pub type Amount = i64;

/// Half-open date range `[check_in, check_out)`.
///
/// The check-out day is not part of the stay, so a stay ending on day D and
/// another starting on day D never overlap (same-day turnover).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl Stay {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "Stay check_in must be before check_out");
        Self { check_in, check_out }
    }

    /// `None` unless `check_out` is strictly after `check_in`.
    pub fn try_new(check_in: NaiveDate, check_out: NaiveDate) -> Option<Self> {
        (check_in < check_out).then_some(Self { check_in, check_out })
    }

    /// Number of nights (days between check-in and check-out).
    pub fn nights(&self) -> i64 {
        self.check_out.signed_duration_since(self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.check_in <= day && day < self.check_out
    }

    /// Ordered, and checking in no earlier than `grace_days` before `today`.
    pub fn is_valid(&self, today: NaiveDate, grace_days: u32) -> bool {
        let earliest = today
            .checked_sub_days(Days::new(u64::from(grace_days)))
            .unwrap_or(NaiveDate::MIN);
        self.check_in < self.check_out && self.check_in >= earliest
    }

    /// Every night of the stay, in order. The check-out day is not yielded.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.check_out;
        self.check_in.iter_days().take_while(move |d| *d < end)
    }
}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

// ── Lifecycle states ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccupancyState {
    Pending,
    Confirmed,
    Cancelled,
}

impl OccupancyState {
    /// Pending and confirmed occupancies block the unit; cancelled ones are audit only.
    pub fn is_active(self) -> bool {
        matches!(self, OccupancyState::Pending | OccupancyState::Confirmed)
    }

    pub fn can_transition_to(self, next: OccupancyState) -> bool {
        matches!(
            (self, next),
            (OccupancyState::Pending, OccupancyState::Confirmed)
                | (OccupancyState::Pending, OccupancyState::Cancelled)
                | (OccupancyState::Confirmed, OccupancyState::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OccupancyState::Pending => "pending",
            OccupancyState::Confirmed => "confirmed",
            OccupancyState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(OccupancyState::Pending),
            "confirmed" => Some(OccupancyState::Confirmed),
            "cancelled" | "canceled" => Some(OccupancyState::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OccupancyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldState {
    Active,
    Expired,
    Consumed,
    Released,
}

impl HoldState {
    pub fn as_str(self) -> &'static str {
        match self {
            HoldState::Active => "active",
            HoldState::Expired => "expired",
            HoldState::Consumed => "consumed",
            HoldState::Released => "released",
        }
    }
}

impl fmt::Display for HoldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ──────────────────────────────────────────────────────

/// Catalog reference data for a rentable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: Ulid,
    pub name: Option<String>,
    pub nightly_rate: Amount,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub requester: String,
    pub stay: Stay,
    pub state: OccupancyState,
    pub created_at: Ms,
    /// The hold this occupancy was promoted from, if any.
    pub hold_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub requester: String,
    pub stay: Stay,
    pub expires_at: Ms,
    pub state: HoldState,
    pub created_at: Ms,
}

impl Hold {
    /// An active hold stops blocking the moment `expires_at` passes, whether or
    /// not the expiry sweep has run yet.
    pub fn is_blocking(&self, now: Ms) -> bool {
        self.state == HoldState::Active && now < self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct UnitState {
    pub unit: Unit,
    /// Occupancies in every state, sorted by `stay.check_in`.
    pub occupancies: Vec<Occupancy>,
    /// Holds in every state, sorted by `stay.check_in`.
    pub holds: Vec<Hold>,
}

impl UnitState {
    pub fn new(unit: Unit) -> Self {
        Self {
            unit,
            occupancies: Vec::new(),
            holds: Vec::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.occupancies.len() + self.holds.len()
    }

    /// Insert maintaining sort order by check-in.
    pub fn insert_occupancy(&mut self, occupancy: Occupancy) {
        let pos = self
            .occupancies
            .partition_point(|o| o.stay.check_in <= occupancy.stay.check_in);
        self.occupancies.insert(pos, occupancy);
    }

    /// Insert maintaining sort order by check-in.
    pub fn insert_hold(&mut self, hold: Hold) {
        let pos = self
            .holds
            .partition_point(|h| h.stay.check_in <= hold.stay.check_in);
        self.holds.insert(pos, hold);
    }

    pub fn occupancy(&self, id: Ulid) -> Option<&Occupancy> {
        self.occupancies.iter().find(|o| o.id == id)
    }

    pub fn occupancy_mut(&mut self, id: Ulid) -> Option<&mut Occupancy> {
        self.occupancies.iter_mut().find(|o| o.id == id)
    }

    pub fn hold(&self, id: Ulid) -> Option<&Hold> {
        self.holds.iter().find(|h| h.id == id)
    }

    pub fn hold_mut(&mut self, id: Ulid) -> Option<&mut Hold> {
        self.holds.iter_mut().find(|h| h.id == id)
    }

    /// Occupancies (any state) whose stay overlaps `query`.
    pub fn overlapping_occupancies(&self, query: Stay) -> impl Iterator<Item = &Occupancy> {
        overlapping_in(&self.occupancies, query, |o| &o.stay)
    }

    /// Holds (any state) whose stay overlaps `query`.
    pub fn overlapping_holds(&self, query: Stay) -> impl Iterator<Item = &Hold> {
        overlapping_in(&self.holds, query, |h| &h.stay)
    }
}

/// Binary search skips everything checking in at or after `query.check_out`;
/// the remainder is filtered on check-out.
fn overlapping_in<T>(items: &[T], query: Stay, stay_of: fn(&T) -> &Stay) -> impl Iterator<Item = &T> {
    let right_bound = items.partition_point(|i| stay_of(i).check_in < query.check_out);
    items[..right_bound]
        .iter()
        .filter(move |i| stay_of(i).check_out > query.check_in)
}

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UnitUpserted {
        id: Ulid,
        name: Option<String>,
        nightly_rate: Amount,
        active: bool,
    },
    OccupancyCreated {
        id: Ulid,
        unit_id: Ulid,
        requester: String,
        stay: Stay,
        state: OccupancyState,
        created_at: Ms,
        hold_id: Option<Ulid>,
    },
    OccupancyTransitioned {
        id: Ulid,
        unit_id: Ulid,
        state: OccupancyState,
    },
    HoldPlaced {
        id: Ulid,
        unit_id: Ulid,
        requester: String,
        stay: Stay,
        expires_at: Ms,
        created_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        unit_id: Ulid,
    },
    HoldExpired {
        id: Ulid,
        unit_id: Ulid,
    },
    /// Marks the hold consumed and creates a pending occupancy for the same
    /// requester and stay. One record, so replay sees both or neither.
    HoldConsumed {
        id: Ulid,
        unit_id: Ulid,
        occupancy_id: Ulid,
        created_at: Ms,
    },
}

impl Event {
    pub fn unit_id(&self) -> Ulid {
        match self {
            Event::UnitUpserted { id, .. } => *id,
            Event::OccupancyCreated { unit_id, .. }
            | Event::OccupancyTransitioned { unit_id, .. }
            | Event::HoldPlaced { unit_id, .. }
            | Event::HoldReleased { unit_id, .. }
            | Event::HoldExpired { unit_id, .. }
            | Event::HoldConsumed { unit_id, .. } => *unit_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Why a stay is blocked by an existing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConflictReason {
    Occupied { occupancy_id: Ulid, stay: Stay },
    Held { hold_id: Ulid, stay: Stay, expires_at: Ms },
}

impl ConflictReason {
    pub fn stay(&self) -> Stay {
        match self {
            ConflictReason::Occupied { stay, .. } | ConflictReason::Held { stay, .. } => *stay,
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::Occupied { stay, .. } => write!(f, "occupied {stay}"),
            ConflictReason::Held { stay, .. } => write!(f, "held {stay}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Unavailable {
    UnitInactive,
    Conflicts(Vec<ConflictReason>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub unit_id: Ulid,
    pub stay: Stay,
    pub available: bool,
    pub reason: Option<Unavailable>,
}

impl Availability {
    pub fn available(unit_id: Ulid, stay: Stay) -> Self {
        Self {
            unit_id,
            stay,
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(unit_id: Ulid, stay: Stay, reason: Unavailable) -> Self {
        Self {
            unit_id,
            stay,
            available: false,
            reason: Some(reason),
        }
    }

    pub fn conflicts(&self) -> &[ConflictReason] {
        match &self.reason {
            Some(Unavailable::Conflicts(c)) => c,
            _ => &[],
        }
    }
}

/// The record occupying a calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClaimRef {
    Occupancy(Ulid),
    Hold(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub is_available: bool,
    pub has_check_in: bool,
    pub has_check_out: bool,
    pub occupancy_ref: Option<ClaimRef>,
}

/// A run of free nights. `end` is the check-out day after the last free night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailablePeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub meets_min_stay: bool,
}

impl AvailablePeriod {
    pub fn nights(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days()
    }

    pub fn as_stay(&self) -> Stay {
        Stay::new(self.start, self.end)
    }
}
