//! Error types produced by the Deribit WebSocket client implementation.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Classification of server-side JSON-RPC error codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeribitErrorCategory {
    /// Authorization and token errors (13004, 13009, 13010, 13011).
    Auth,
    /// Throttling responses (10429, 11010).
    RateLimit,
    /// Malformed or rejected request parameters (10001, 11050, 11051).
    Validation,
    /// Server-side faults and maintenance windows (11003, 10028, 11060).
    System,
    /// Order-state conflicts (10009, 10010, 10011).
    Order,
    /// Subscription handling failures (11041).
    Subscription,
    /// Anything the taxonomy does not recognize.
    Unknown,
}

impl DeribitErrorCategory {
    /// Classifies a Deribit JSON-RPC error code.
    #[must_use]
    pub const fn classify(code: i64) -> Self {
        match code {
            13004 | 13009 | 13010 | 13011 => Self::Auth,
            10429 | 11010 => Self::RateLimit,
            10001 | 11050 | 11051 => Self::Validation,
            11003 | 10028 | 11060 => Self::System,
            10009 | 10010 | 10011 => Self::Order,
            11041 => Self::Subscription,
            _ => Self::Unknown,
        }
    }
}

/// Returns `true` when `code` must trigger re-authentication.
#[must_use]
pub const fn requires_reauth(code: i64) -> bool {
    matches!(code, 13004 | 13009 | 13010 | 13011)
}

/// Returns `true` when `code` is a throttling response that must feed the
/// adaptive rate limiter.
#[must_use]
pub const fn is_rate_limit_code(code: i64) -> bool {
    matches!(code, 10429 | 11010)
}

/// A typed error enumeration for the Deribit WebSocket client.
#[derive(Debug, Clone, Error)]
pub enum DeribitWsError {
    /// Transport-level failure (connect, send, close).
    #[error("Transport error: {0}")]
    Transport(String),
    /// Failure during JSON serialization/deserialization.
    #[error("JSON error: {0}")]
    Json(String),
    /// The request was rejected before encoding.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// A per-method deadline elapsed before the response arrived.
    #[error("Request timed out: {method}")]
    Timeout { method: String },
    /// Error returned by the server, classified by code.
    #[error("Deribit error {code} ({category:?}): {message}")]
    Rpc {
        category: DeribitErrorCategory,
        code: i64,
        message: String,
    },
    /// The rate limiter rejected the request outright.
    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    /// No `api_key`/`client_id` was supplied for authentication.
    #[error("Missing API key")]
    MissingApiKey,
    /// No `secret` was supplied for authentication.
    #[error("Missing API secret")]
    MissingApiSecret,
    /// A bootstrap step failed; the connection stays up unauthenticated.
    #[error("Bootstrap step {step} failed: {reason}")]
    Bootstrap { step: u8, reason: String },
    /// Resubscription retries exhausted for the listed channels.
    #[error("Resubscription failed for channels: {channels:?}")]
    ResubscriptionFailed { channels: Vec<String> },
    /// A response envelope that matches no in-flight request shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// The connection closed while the request was in flight.
    #[error("Connection closed")]
    ConnectionClosed,
    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,
    /// Catch-all for client-side failures.
    #[error("Client error: {0}")]
    ClientError(String),
}

impl From<tungstenite::Error> for DeribitWsError {
    fn from(error: tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for DeribitWsError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

impl DeribitWsError {
    /// Builds the classified variant for a server error response.
    #[must_use]
    pub fn from_rpc_error(code: i64, message: String) -> Self {
        Self::Rpc {
            category: DeribitErrorCategory::classify(code),
            code,
            message,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
