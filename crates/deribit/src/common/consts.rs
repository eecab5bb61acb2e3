//! Core constants shared across the Deribit client components.

pub const DERIBIT: &str = "DERIBIT";

/// Default WebSocket host (Deribit test environment).
///
/// Production deployments override this with `www.deribit.com` via
/// configuration or the `DERIBIT_HOST` environment variable.
pub const DERIBIT_TEST_HOST: &str = "test.deribit.com";
pub const DERIBIT_PROD_HOST: &str = "www.deribit.com";

pub const DERIBIT_WS_PORT: u16 = 443;
pub const DERIBIT_WS_PATH: &str = "/ws/api/v2";

/// Client identification sent in `public/hello` during bootstrap.
pub const DEFAULT_CLIENT_NAME: &str = "market_maker";
pub const DEFAULT_CLIENT_VERSION: &str = "1.0.0";

/// Server-enforced minimum heartbeat interval in seconds.
pub const HEARTBEAT_FLOOR_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Bounds and default for the pre-expiry token refresh threshold (seconds).
pub const REFRESH_THRESHOLD_MIN_SECS: u64 = 1;
pub const REFRESH_THRESHOLD_MAX_SECS: u64 = 899;
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 180;

/// Delay before the single token-refresh retry.
pub const REFRESH_RETRY_DELAY_SECS: u64 = 5;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RESUBSCRIBE_MAX_RETRIES: u32 = 3;

/// Default time-sync period when the service is driven standalone (ms).
pub const DEFAULT_TIME_SYNC_INTERVAL_MS: u64 = 300_000;
/// Default time-sync period taken from configuration (ms).
pub const DEFAULT_TIME_SYNC_CONFIG_INTERVAL_MS: u64 = 3_600_000;

// Well-known JSON-RPC methods
pub const METHOD_AUTH: &str = "public/auth";
pub const METHOD_HELLO: &str = "public/hello";
pub const METHOD_GET_TIME: &str = "public/get_time";
pub const METHOD_STATUS: &str = "public/status";
pub const METHOD_TEST: &str = "public/test";
pub const METHOD_SET_HEARTBEAT: &str = "public/set_heartbeat";
pub const METHOD_LOGOUT: &str = "private/logout";
pub const METHOD_ENABLE_COD: &str = "private/enable_cancel_on_disconnect";
pub const METHOD_DISABLE_COD: &str = "private/disable_cancel_on_disconnect";
pub const METHOD_SUBSCRIBE_PUBLIC: &str = "public/subscribe";
pub const METHOD_SUBSCRIBE_PRIVATE: &str = "private/subscribe";
pub const METHOD_UNSUBSCRIBE_PUBLIC: &str = "public/unsubscribe";
pub const METHOD_UNSUBSCRIBE_PRIVATE: &str = "private/unsubscribe";
pub const METHOD_UNSUBSCRIBE_ALL: &str = "public/unsubscribe_all";
