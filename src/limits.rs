pub const MAX_NAME_LEN: usize = 128;
pub const MAX_DESCRIPTION_LEN: usize = 512;
pub const MAX_LOCATION_LEN: usize = 512;
pub const MAX_USER_LEN: usize = 128;
pub const MAX_PURPOSE_LEN: usize = 1024;
pub const MAX_CONTACT_LEN: usize = 256;

/// Depth bound for storage key paths (`reservations/<id>` is 2).
pub const MAX_PATH_DEPTH: usize = 8;

/// Buffered deliveries per backend watch before a slow reader lags.
pub const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Pending WAL appends queued for the group-commit writer.
pub const WAL_QUEUE_CAPACITY: usize = 4096;
