//! WebSocket endpoint URL helpers.

use crate::common::{
    consts::{DERIBIT_TEST_HOST, DERIBIT_WS_PATH, DERIBIT_WS_PORT},
    env::get_env_var,
};

/// Gets the WebSocket host, preferring the override then the environment.
#[must_use]
pub fn get_ws_host(host_override: Option<&str>) -> String {
    if let Some(host) = host_override {
        return host.to_string();
    }
    get_env_var("DERIBIT_HOST").unwrap_or_else(|_| DERIBIT_TEST_HOST.to_string())
}

/// Builds the full WebSocket URL for the given host.
#[must_use]
pub fn get_ws_url(host_override: Option<&str>) -> String {
    let host = get_ws_host(host_override);
    format!("wss://{host}:{DERIBIT_WS_PORT}{DERIBIT_WS_PATH}")
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_default_url_targets_test_environment() {
        assert_eq!(
            get_ws_url(None),
            "wss://test.deribit.com:443/ws/api/v2"
        );
    }

    #[rstest]
    fn test_host_override() {
        assert_eq!(
            get_ws_url(Some("www.deribit.com")),
            "wss://www.deribit.com:443/ws/api/v2"
        );
    }
}
