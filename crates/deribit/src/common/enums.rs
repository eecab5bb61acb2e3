//! Enumerations shared across the Deribit client components.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Lifecycle state of a client connection.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeribitConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Reconnecting,
    Closed,
}

/// Typed jump from one session to its successor.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeribitSessionTransition {
    /// First authentication on a connection.
    Initial,
    /// Token refresh keeping the same session identity.
    Refresh,
    /// Subaccount switch via `grant_type=exchange_token`.
    Exchange,
    /// Named session via `grant_type=fork_token`.
    Fork,
}

/// Direction of an order.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeribitOrderDirection {
    Buy,
    Sell,
}

/// State of a tracked channel subscription.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeribitSubscriptionStatus {
    /// Subscribe request sent, confirmation outstanding.
    Pending,
    /// Confirmed by the server.
    Active,
    /// Being replayed after a session change or reconnect.
    Resubscribing,
    /// Gave up after exhausting resubscription retries.
    Failed,
}

/// Token-bucket presets trading throughput against 429 exposure.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeribitRateLimitMode {
    Cautious,
    #[default]
    Normal,
    Aggressive,
}

/// Scope applied to `private/enable_cancel_on_disconnect`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeribitCodScope {
    #[default]
    Connection,
    Account,
}

/// Operation classes used for rate-limit token costs.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeribitOperationKind {
    Subscription,
    Auth,
    Query,
    Order,
    Cancel,
    HighPriority,
}

impl DeribitOperationKind {
    /// Token cost charged on admission.
    #[must_use]
    pub const fn cost(&self) -> u64 {
        match self {
            Self::Subscription => 5,
            Self::Auth => 10,
            Self::Query => 1,
            Self::Order => 10,
            Self::Cancel => 3,
            Self::HighPriority => 0,
        }
    }

    /// Infers the operation class from a JSON-RPC method name.
    ///
    /// Rules apply in order, first match wins.
    #[must_use]
    pub fn infer(method: &str) -> Self {
        if method.starts_with("public/auth") || method.contains("token") {
            Self::Auth
        } else if method.contains("subscribe") {
            Self::Subscription
        } else if method.contains("cancel") {
            Self::Cancel
        } else if method.contains("order") {
            Self::Order
        } else {
            Self::Query
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
    #[case("public/auth", DeribitOperationKind::Auth)]
    #[case("public/exchange_token", DeribitOperationKind::Auth)]
    #[case("public/fork_token", DeribitOperationKind::Auth)]
    #[case("public/subscribe", DeribitOperationKind::Subscription)]
    #[case("private/unsubscribe_all", DeribitOperationKind::Subscription)]
    #[case("private/cancel_all", DeribitOperationKind::Cancel)]
    #[case("private/buy_order", DeribitOperationKind::Order)]
    #[case("public/get_time", DeribitOperationKind::Query)]
    #[case("public/status", DeribitOperationKind::Query)]
    fn test_operation_inference(#[case] method: &str, #[case] expected: DeribitOperationKind) {
        assert_eq!(DeribitOperationKind::infer(method), expected);
    }

    #[rstest]
    fn test_operation_costs() {
        assert_eq!(DeribitOperationKind::Subscription.cost(), 5);
        assert_eq!(DeribitOperationKind::Auth.cost(), 10);
        assert_eq!(DeribitOperationKind::Query.cost(), 1);
        assert_eq!(DeribitOperationKind::Order.cost(), 10);
        assert_eq!(DeribitOperationKind::Cancel.cost(), 3);
        assert_eq!(DeribitOperationKind::HighPriority.cost(), 0);
    }

    #[rstest]
    fn test_rate_limit_mode_parse() {
        assert_eq!(
            "aggressive".parse::<DeribitRateLimitMode>().unwrap(),
            DeribitRateLimitMode::Aggressive
        );
        assert_eq!(
            "NORMAL".parse::<DeribitRateLimitMode>().unwrap(),
            DeribitRateLimitMode::Normal
        );
        assert!("turbo".parse::<DeribitRateLimitMode>().is_err());
    }

    #[rstest]
    fn test_cod_scope_serialization() {
        let scope = DeribitCodScope::Connection;
        assert_eq!(serde_json::to_string(&scope).unwrap(), "\"connection\"");
    }
}
