use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MIN_NAME_LEN: usize = 2;
pub const MAX_ASSETS_PER_BOOKING: usize = 500;
/// Largest encoded event the WAL accepts or trusts on replay.
pub const MAX_WAL_FRAME_BYTES: usize = 1 << 20;
pub const MAX_ASSETS_PER_ORGANIZATION: usize = 100_000;
pub const MAX_BOOKINGS_PER_ORGANIZATION: usize = 100_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// 366 days
pub const MAX_WINDOW_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;
