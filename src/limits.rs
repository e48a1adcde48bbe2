use std::time::Duration;

pub const MAX_PROPERTY_ID_LEN: usize = 128;
pub const MAX_ACTOR_ID_LEN: usize = 128;
pub const MAX_CLIENT_FIELD_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_PROPERTIES: usize = 100_000;
pub const MAX_RESERVATIONS_PER_PROPERTY: usize = 50_000;
pub const MAX_BLACKOUTS: usize = 10_000;

/// Upper bound for `upcoming_reservations` look-ahead.
pub const MAX_UPCOMING_DAYS: u32 = 366;
pub const DEFAULT_UPCOMING_DAYS: u32 = 30;

/// How long a caller waits to enqueue a WAL append before backing off.
pub const WAL_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
/// Enqueue attempts before surfacing `Transient`.
pub const WAL_ENQUEUE_ATTEMPTS: u32 = 3;
pub const WAL_RETRY_BASE_BACKOFF: Duration = Duration::from_millis(25);
pub const WAL_CHANNEL_CAPACITY: usize = 4096;

/// How often the compactor checks the WAL append count.
pub const COMPACTION_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Grace period for open connections at shutdown.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
