/// Maximum live bookings held by one store.
pub const MAX_BOOKINGS: usize = 1_000_000;

/// Maximum byte length of `service_type`, `date`, and `location`.
pub const MAX_FIELD_LEN: usize = 256;

/// Maximum WAL record payload accepted on replay (guards against a corrupt length prefix).
pub const MAX_WAL_RECORD_LEN: usize = 16 * 1024 * 1024;
