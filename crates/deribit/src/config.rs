//! Configuration for the Deribit WebSocket client.

use serde::{Deserialize, Serialize};

use crate::{
    common::{
        consts::{
            DEFAULT_CLIENT_NAME, DEFAULT_CLIENT_VERSION, DEFAULT_HEARTBEAT_SECS,
            DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RESUBSCRIBE_MAX_RETRIES,
            DEFAULT_TIME_SYNC_CONFIG_INTERVAL_MS, HEARTBEAT_FLOOR_SECS,
            REFRESH_THRESHOLD_MAX_SECS, REFRESH_THRESHOLD_MIN_SECS,
        },
        credential::Credential,
        enums::{DeribitCodScope, DeribitRateLimitMode},
        env::{get_env_var, parse_env_var},
        urls::get_ws_url,
    },
    websocket::{error::DeribitWsError, session::validate_refresh_threshold},
};

/// Configuration for the Deribit WebSocket client.
///
/// Environment variables override the configured values when present and
/// valid; invalid values are reported and the configured value (or the
/// built-in default) applies instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeribitClientConfig {
    /// WebSocket host override (e.g. `www.deribit.com`); defaults to the
    /// test environment.
    pub host: Option<String>,
    /// Full WebSocket URL override; wins over `host` when set.
    pub base_url_ws: Option<String>,
    /// API key; `client_id` is accepted interchangeably.
    pub api_key: Option<String>,
    /// Alias for `api_key`.
    pub client_id: Option<String>,
    /// API secret.
    pub api_secret: Option<String>,
    /// Seconds before token expiry to refresh; valid range `[1, 899]`.
    pub auth_refresh_threshold_secs: Option<u64>,
    /// Token-bucket preset.
    pub rate_limit_mode: DeribitRateLimitMode,
    /// Run the auth flow during bootstrap.
    pub authenticate: bool,
    /// Client identification sent in `public/hello`.
    pub client_name: String,
    pub client_version: String,
    /// Server heartbeat interval in seconds, floored to 10 on the wire.
    pub heartbeat_interval_secs: u64,
    /// Enable cancel-on-disconnect during bootstrap.
    pub cod_enabled: bool,
    pub cod_scope: DeribitCodScope,
    /// Start the time-sync service on connect.
    pub time_sync_enabled: bool,
    /// Seed the clock during bootstrap (first tick immediate).
    pub time_sync_auto_sync_on_connect: bool,
    /// Time-sync period in milliseconds.
    pub time_sync_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub resubscribe_max_retries: u32,
}

impl Default for DeribitClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            base_url_ws: None,
            api_key: None,
            client_id: None,
            api_secret: None,
            auth_refresh_threshold_secs: None,
            rate_limit_mode: DeribitRateLimitMode::Normal,
            authenticate: true,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            client_version: DEFAULT_CLIENT_VERSION.to_string(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_SECS,
            cod_enabled: true,
            cod_scope: DeribitCodScope::Connection,
            time_sync_enabled: true,
            time_sync_auto_sync_on_connect: true,
            time_sync_interval_ms: DEFAULT_TIME_SYNC_CONFIG_INTERVAL_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            resubscribe_max_retries: DEFAULT_RESUBSCRIBE_MAX_RETRIES,
        }
    }
}

impl DeribitClientConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `DERIBIT_*` environment overrides in place.
    ///
    /// Each override wins only when present and valid.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(client_id) = get_env_var("DERIBIT_CLIENT_ID") {
            self.client_id = Some(client_id);
        }
        if let Ok(secret) = get_env_var("DERIBIT_CLIENT_SECRET") {
            self.api_secret = Some(secret);
        }
        if let Ok(host) = get_env_var("DERIBIT_HOST") {
            self.host = Some(host);
        }
        if let Some(threshold) = parse_env_var::<u64>("DERIBIT_AUTH_REFRESH_THRESHOLD") {
            if (REFRESH_THRESHOLD_MIN_SECS..=REFRESH_THRESHOLD_MAX_SECS).contains(&threshold) {
                self.auth_refresh_threshold_secs = Some(threshold);
            } else {
                tracing::warn!(
                    target: "deribit_client",
                    value = threshold,
                    "DERIBIT_AUTH_REFRESH_THRESHOLD out of range, ignoring",
                );
            }
        }
        if let Some(mode) = parse_env_var::<DeribitRateLimitMode>("DERIBIT_RATE_LIMIT_MODE") {
            self.rate_limit_mode = mode;
        }
        if let Ok(name) = get_env_var("DERIBIT_CLIENT_NAME") {
            self.client_name = name;
        }
        if let Ok(version) = get_env_var("DERIBIT_CLIENT_VERSION") {
            self.client_version = version;
        }
    }

    /// Returns `true` when credential material is configured.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        (self.api_key.is_some() || self.client_id.is_some()) && self.api_secret.is_some()
    }

    /// Builds the credential from the configured key material.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::MissingApiKey`] or
    /// [`DeribitWsError::MissingApiSecret`] when a field is absent.
    pub fn credential(&self) -> Result<Credential, DeribitWsError> {
        Credential::from_parts(
            self.api_key.clone(),
            self.client_id.clone(),
            self.api_secret.clone(),
        )
    }

    /// The WebSocket URL: the full override when set, otherwise built from
    /// the effective host.
    #[must_use]
    pub fn ws_url(&self) -> String {
        self.base_url_ws
            .clone()
            .unwrap_or_else(|| get_ws_url(self.host.as_deref()))
    }

    /// The validated refresh threshold in seconds.
    #[must_use]
    pub fn effective_refresh_threshold_secs(&self) -> u64 {
        validate_refresh_threshold(self.auth_refresh_threshold_secs)
    }

    /// The heartbeat interval actually sent to the server (floored to 10 s).
    #[must_use]
    pub fn effective_heartbeat_secs(&self) -> u64 {
        self.heartbeat_interval_secs.max(HEARTBEAT_FLOOR_SECS)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
