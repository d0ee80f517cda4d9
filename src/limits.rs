/// Requested + Confirmed reservations a single resource may hold at once.
pub const MAX_ACTIVE_PER_RESOURCE: usize = 10_000;

/// Cancellation reasons longer than this are rejected.
pub const MAX_REASON_LEN: usize = 1024;

/// How far ahead of the clock's current day a slot may be booked.
pub const MAX_ADVANCE_DAYS: i64 = 730;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// Working-hours windows accepted by an availability query.
pub const MAX_WORKING_WINDOWS: usize = 48;
