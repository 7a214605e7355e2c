use crate::model::Minute;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_ADDRESS_LEN: usize = 400;
pub const MAX_NOTES_LEN: usize = 1_000;
pub const MAX_REASON_LEN: usize = 500;

pub const MAX_WINDOWS_PER_RULE: usize = 48;
pub const MAX_RULES_PER_BUSINESS: usize = 10_000;

pub const MIN_SLOT_MINUTES: Minute = 5;
pub const MAX_SLOT_MINUTES: Minute = 720;

/// Widest inclusive date range accepted by multi-day availability queries.
pub const MAX_RANGE_DAYS: i64 = 92;

/// Upper bound on the booking horizon a business may configure.
pub const MAX_ADVANCE_DAYS: u32 = 3_650;
