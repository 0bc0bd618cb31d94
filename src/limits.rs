//! Hard limits on untrusted input. Exceeding one yields `EngineError::LimitExceeded`.

/// Loaded tenant engines per process.
pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 63;

pub const MAX_UNITS_PER_TENANT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REQUESTER_LEN: usize = 256;

/// Occupancies plus holds (any state) retained for a single unit.
pub const MAX_RECORDS_PER_UNIT: usize = 50_000;

pub const MAX_STAY_NIGHTS: i64 = 366;

/// Widest calendar / period window, in days.
pub const MAX_QUERY_DAYS: i64 = 731;

pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

pub const MAX_HOLD_MINUTES: u32 = 24 * 60;

/// How far ahead `next_available_window` searches.
pub const NEXT_WINDOW_HORIZON_DAYS: u64 = 365;

/// Calendar years accepted for any stay or query date.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;

pub const MAX_SQL_LEN: usize = 64 * 1024;
