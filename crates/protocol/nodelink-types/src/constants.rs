//! Protocol constants for the nodelink communication layer.
//!
//! These constants define timing bounds, health-check parameters,
//! message limits and routing defaults.

// =============================================================================
// Handshake
// =============================================================================

/// Maximum time for a connection handshake round trip: 15 seconds
pub const HANDSHAKE_TIMEOUT_MS: u64 = 15_000;

/// Delay before connecting to configured contacts on startup: 2.5 seconds
pub const STARTUP_CONNECT_DELAY_MS: u64 = 2_500;

// =============================================================================
// Requests
// =============================================================================

/// Default timeout for a request on a connection: 30 seconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Timeout applied when forwarding a request to the next hop: 30 seconds
pub const FORWARDING_TIMEOUT_MS: u64 = 30_000;

/// Dispatch time above which a slow-dispatch diagnostic is logged: 2 seconds
pub const SLOW_DISPATCH_THRESHOLD_MS: u64 = 2_000;

/// Maximum hop count a routed request may accumulate
pub const MAX_HOP_COUNT: u32 = 16;

// =============================================================================
// Messages
// =============================================================================

/// Time-to-live of every queued message: 60 seconds
pub const MESSAGE_TTL_MS: u64 = 60_000;

/// Maximum size of a single transport frame: 10 MB
pub const MAX_FRAME_SIZE: usize = 10_485_760;

/// How long an inbox consumer waits for a message before re-checking its state
pub const CONSUMER_POLL_INTERVAL_MS: u64 = 1_000;

// =============================================================================
// Health Checks
// =============================================================================

/// Interval between health-check rounds: 15 seconds
pub const HEALTH_CHECK_INTERVAL_MS: u64 = 15_000;

/// Maximum random delay before an individual health check: 9 seconds
pub const HEALTH_CHECK_MAX_JITTER_MS: u64 = 9_000;

/// Timeout of a single health-check request: 5 seconds
pub const HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;

/// Consecutive health-check failures before a connection is considered broken
pub const HEALTH_CHECK_FAILURE_LIMIT: u32 = 3;

// =============================================================================
// Execution
// =============================================================================

/// Default number of concurrently running worker tasks
pub const DEFAULT_WORKER_POOL_SIZE: usize = 64;

// =============================================================================
// Addresses
// =============================================================================

/// Bind address used when none is configured
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// External address used when none is configured
pub const DEFAULT_EXTERNAL_ADDRESS: &str = "127.0.0.1";

/// Default port of the broker transport
pub const DEFAULT_BROKER_PORT: u16 = 21_000;
