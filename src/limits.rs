use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single appointment: 24 hours.
pub const MAX_APPOINTMENT_DURATION_MS: Ms = 24 * 3_600_000;
/// Offsets beyond ±18h are not real timezones.
pub const MAX_UTC_OFFSET_SECS: i32 = 18 * 3600;

pub const MAX_SERVICES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_MESSAGE_LEN: usize = 2048;

pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 100_000;
pub const MAX_WAITING_PER_PROVIDER: usize = 10_000;
pub const MAX_NOTIFICATIONS_PER_USER: usize = 10_000;
