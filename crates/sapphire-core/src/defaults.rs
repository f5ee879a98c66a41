//! Centralized default constants for sapphire.
//!
//! All crates and the daemon reference these constants instead of defining
//! their own magic numbers.

// =============================================================================
// EMBEDDING SCHEDULER
// =============================================================================

/// Interval between scheduler ticks in milliseconds.
pub const SCHEDULER_INTERVAL_MS: u64 = 10_000;

/// Delay before the first scheduler tick in milliseconds.
pub const SCHEDULER_STARTUP_DELAY_MS: u64 = 10_000;

/// Maximum images claimed per embedding batch.
pub const SCHEDULER_BATCH_SIZE: usize = 8;

/// Timeout for a single embedding call in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Failed embedding attempts after which an image is abandoned.
pub const EMBED_MAX_ATTEMPTS: i32 = 3;

/// Latency of the simulated embedding backend in milliseconds.
pub const EMBED_SIMULATED_LATENCY_MS: u64 = 1_000;

/// Limit used when sweeping images stranded in `Embedding` at startup.
pub const STALE_CLAIM_SWEEP_LIMIT: i64 = 10_000;

/// Scheduler event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// CONSENSUS
// =============================================================================

/// Submissions required before consensus is evaluated.
pub const CONSENSUS_QUORUM: usize = 3;

/// Contributing (qualified, parseable) submissions required to accept.
pub const CONSENSUS_MIN_QUALIFIED: usize = 2;

/// Maximum center deviation from the consensus, relative to the consensus
/// width (x axis) or height (y axis).
pub const CONSENSUS_TOLERANCE: f64 = 0.5;

// =============================================================================
// PAGINATION
// =============================================================================

/// Internal "fetch everything" limit for export queries.
pub const INTERNAL_FETCH_LIMIT: i64 = 10_000;
