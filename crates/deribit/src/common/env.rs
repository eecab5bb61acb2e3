//! Environment variable helpers with validated typed parsing.

use std::str::FromStr;

/// Returns the value of `key` from the process environment.
///
/// Loads `.env` entries on first use so local development setups work without
/// exporting variables manually.
///
/// # Errors
///
/// Returns an error if the variable is unset or empty.
pub fn get_env_var(key: &str) -> anyhow::Result<String> {
    dotenvy::dotenv().ok();

    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => anyhow::bail!("environment variable {key} must be set"),
    }
}

/// Returns `value` when present, otherwise falls back to the environment.
///
/// # Errors
///
/// Returns an error if neither source provides a value.
pub fn get_or_env_var(value: Option<String>, key: &str) -> anyhow::Result<String> {
    match value {
        Some(value) => Ok(value),
        None => get_env_var(key),
    }
}

/// Parses `key` from the environment into `T`.
///
/// Returns `None` when the variable is unset. An unparseable value emits a
/// warning and also returns `None` so the caller falls through to the next
/// configuration source.
pub fn parse_env_var<T: FromStr>(key: &str) -> Option<T> {
    let raw = get_env_var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                target: "deribit_client",
                key,
                value = %raw,
                "Invalid environment value, falling through to next source",
            );
            None
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_missing_var_errors() {
        assert!(get_env_var("DERIBIT_TEST_SURELY_UNSET_VAR").is_err());
    }

    #[rstest]
    fn test_get_or_env_var_prefers_value() {
        let value = get_or_env_var(Some("direct".to_string()), "DERIBIT_TEST_SURELY_UNSET_VAR");
        assert_eq!(value.unwrap(), "direct");
    }

    #[rstest]
    fn test_parse_env_var_unset_is_none() {
        assert_eq!(parse_env_var::<u64>("DERIBIT_TEST_SURELY_UNSET_VAR"), None);
    }
}
