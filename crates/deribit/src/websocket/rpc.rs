//! Request/response correlation for the JSON-RPC session.
//!
//! The correlator assigns ids, validates and encodes outgoing requests,
//! injects the access token into private methods, and tracks in-flight
//! requests with per-method deadlines. Each entry carries a caller-defined
//! context value the connection actor uses to route response side effects.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use serde_json::Value;

use crate::{
    common::consts::{METHOD_AUTH, METHOD_GET_TIME, METHOD_LOGOUT, METHOD_TEST},
    websocket::{error::DeribitWsError, messages::JsonRpcRequest},
};

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Shared monotonically increasing request id source.
///
/// Shared with the transport so the stateless heartbeat responder can stamp
/// `public/test` frames without a round trip through the connection actor.
#[derive(Clone, Debug, Default)]
pub struct RequestIdGenerator(Arc<AtomicU64>);

impl RequestIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    /// Returns the next id; ids are unique for the connection lifetime.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// An in-flight request exclusively owned by the correlator.
#[derive(Debug)]
pub struct PendingRequest<C> {
    pub method: String,
    pub sent_at_ms: u64,
    pub deadline_ms: u64,
    pub context: C,
}

/// Per-method timeout table.
#[must_use]
pub fn method_timeout_ms(method: &str, override_ms: Option<u64>) -> u64 {
    match method {
        METHOD_AUTH => 30_000,
        METHOD_LOGOUT => 5_000,
        METHOD_TEST => 2_000,
        METHOD_GET_TIME => 5_000,
        _ => override_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS),
    }
}

/// Validates a method path (`public/x` or `private/x`).
///
/// # Errors
///
/// Returns [`DeribitWsError::InvalidRequest`] for malformed method names.
pub fn validate_method(method: &str) -> Result<(), DeribitWsError> {
    let valid = match method.split_once('/') {
        Some((scope, name)) => matches!(scope, "public" | "private") && !name.is_empty(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DeribitWsError::InvalidRequest(format!(
            "method must be a public/ or private/ path, got {method:?}"
        )))
    }
}

/// Builds the outgoing envelope for `method`, injecting the access token
/// into private method params when one is active.
///
/// Public methods never carry a token, even when one is available.
///
/// # Errors
///
/// Returns [`DeribitWsError::InvalidRequest`] when the method path is
/// malformed or `params` is not a JSON object.
pub fn encode_request(
    id: u64,
    method: &str,
    mut params: Value,
    access_token: Option<&str>,
) -> Result<JsonRpcRequest, DeribitWsError> {
    validate_method(method)?;
    let Some(map) = params.as_object_mut() else {
        return Err(DeribitWsError::InvalidRequest(
            "params must be a JSON object".to_string(),
        ));
    };

    if method.starts_with("private/")
        && let Some(token) = access_token
    {
        map.insert("access_token".to_string(), Value::String(token.to_string()));
    }

    Ok(JsonRpcRequest::new(id, method, params))
}

/// Tracks in-flight requests for one connection.
#[derive(Debug)]
pub struct Correlator<C> {
    pending: AHashMap<u64, PendingRequest<C>>,
}

impl<C> Default for Correlator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Correlator<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: AHashMap::new(),
        }
    }

    /// Registers an in-flight request.
    pub fn track(&mut self, id: u64, method: String, context: C, now_ms: u64, timeout_ms: u64) {
        self.pending.insert(
            id,
            PendingRequest {
                method,
                sent_at_ms: now_ms,
                deadline_ms: now_ms + timeout_ms,
                context,
            },
        );
    }

    /// Settles an in-flight request by response id.
    ///
    /// Unknown ids (late responses after timeout or cancellation, duplicate
    /// deliveries, transport-level heartbeat replies) return `None` and are
    /// ignored by the caller.
    pub fn settle(&mut self, id: u64) -> Option<PendingRequest<C>> {
        self.pending.remove(&id)
    }

    /// Removes and returns every request whose deadline has passed.
    pub fn collect_expired(&mut self, now_ms: u64) -> Vec<(u64, PendingRequest<C>)> {
        let expired_ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline_ms <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|request| (id, request)))
            .collect()
    }

    /// The earliest pending deadline, for the actor's timeout timer.
    #[must_use]
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.pending.values().map(|r| r.deadline_ms).min()
    }

    /// Empties the table, returning every entry so the caller can fail the
    /// associated waiters (connection close path).
    pub fn drain_all(&mut self) -> Vec<(u64, PendingRequest<C>)> {
        self.pending.drain().collect()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn test_id_generator_monotonic() {
        let ids = RequestIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a < b && b < c);
        assert_eq!(a, 1);
    }

    #[rstest]
    #[case("public/auth", 30_000)]
    #[case("private/logout", 5_000)]
    #[case("public/test", 2_000)]
    #[case("public/get_time", 5_000)]
    #[case("public/status", 10_000)]
    #[case("private/subscribe", 10_000)]
    fn test_method_timeouts(#[case] method: &str, #[case] expected_ms: u64) {
        assert_eq!(method_timeout_ms(method, None), expected_ms);
    }

    #[rstest]
    fn test_timeout_override_applies_to_other_methods_only() {
        assert_eq!(method_timeout_ms("private/subscribe", Some(2_500)), 2_500);
        assert_eq!(method_timeout_ms("public/auth", Some(2_500)), 30_000);
    }

    #[rstest]
    #[case("public/get_time", true)]
    #[case("private/logout", true)]
    #[case("", false)]
    #[case("get_time", false)]
    #[case("public/", false)]
    #[case("internal/x", false)]
    fn test_method_validation(#[case] method: &str, #[case] ok: bool) {
        assert_eq!(validate_method(method).is_ok(), ok);
    }

    #[rstest]
    fn test_private_method_gets_token_injected() {
        let request =
            encode_request(1, "private/subscribe", json!({"channels": []}), Some("tok")).unwrap();
        assert_eq!(request.params["access_token"], "tok");
    }

    #[rstest]
    fn test_public_method_never_carries_token() {
        let request =
            encode_request(1, "public/subscribe", json!({"channels": []}), Some("tok")).unwrap();
        assert!(request.params.get("access_token").is_none());
    }

    #[rstest]
    fn test_private_method_without_token_sends_bare_params() {
        let request = encode_request(1, "private/get_positions", json!({}), None).unwrap();
        assert!(request.params.get("access_token").is_none());
    }

    #[rstest]
    fn test_non_object_params_rejected() {
        let result = encode_request(1, "public/test", json!([1, 2]), None);
        assert!(matches!(result, Err(DeribitWsError::InvalidRequest(_))));
    }

    #[rstest]
    fn test_settle_removes_entry_and_ignores_duplicates() {
        let mut correlator: Correlator<()> = Correlator::new();
        correlator.track(5, "public/get_time".to_string(), (), 0, 5_000);

        assert!(correlator.settle(5).is_some());
        assert!(correlator.settle(5).is_none());
        assert_eq!(correlator.in_flight(), 0);
    }

    #[rstest]
    fn test_expiry_collection() {
        let mut correlator: Correlator<()> = Correlator::new();
        correlator.track(1, "public/test".to_string(), (), 0, 2_000);
        correlator.track(2, "public/status".to_string(), (), 0, 10_000);

        assert_eq!(correlator.next_deadline_ms(), Some(2_000));

        let expired = correlator.collect_expired(2_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        assert_eq!(correlator.in_flight(), 1);
        assert_eq!(correlator.next_deadline_ms(), Some(10_000));
    }

    #[rstest]
    fn test_drain_all_empties_table() {
        let mut correlator: Correlator<&'static str> = Correlator::new();
        correlator.track(1, "private/subscribe".to_string(), "a", 0, 10_000);
        correlator.track(2, "private/logout".to_string(), "b", 0, 5_000);

        let drained = correlator.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(correlator.in_flight(), 0);
    }
}
