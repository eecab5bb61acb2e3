//! Persistent, authenticated JSON-RPC-over-WebSocket client for the
//! [Deribit](https://www.deribit.com) cryptocurrency exchange.
//!
//! The `deribit-client` crate keeps one long-lived connection per client and
//! hides the operational machinery behind a small async API: `connect`,
//! `authenticate`, `call`, `subscribe`, `unsubscribe`, `disconnect`.
//!
//! Behind that surface the crate maintains:
//!
//! - A session/token state machine covering the initial grant, scheduled
//!   refresh, token exchange (subaccount switch), token fork (named session)
//!   and logout, preserving order and subscription context across
//!   transitions.
//! - An adaptive token-bucket rate limiter that backs off exponentially on
//!   server 429 responses and recovers capacity gradually.
//! - A reconnection pipeline that replays the bootstrap sequence and
//!   resubscribes tracked channels after transport loss.
//! - A request/response correlator with per-method timeouts and a classified
//!   error taxonomy.
//! - A time-synchronization service tracking the server-clock offset
//!   compensated for round-trip latency.
//!
//! # Example
//!
//! ```no_run
//! use deribit_client::{DeribitClientConfig, DeribitWebSocketClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = DeribitWebSocketClient::new(DeribitClientConfig::from_env())?;
//!     client.connect().await?;
//!     client.subscribe("ticker.BTC-PERPETUAL.100ms", json!({})).await?;
//!     let server_time = client.get_time().await?;
//!     println!("server time: {server_time}");
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod common;
pub mod config;
pub mod websocket;

// Re-exports
pub use crate::{
    common::{
        credential::Credential,
        enums::{
            DeribitCodScope, DeribitConnectionState, DeribitOperationKind, DeribitOrderDirection,
            DeribitRateLimitMode, DeribitSessionTransition, DeribitSubscriptionStatus,
        },
    },
    config::DeribitClientConfig,
    websocket::{
        client::{ConnectionInfo, DeribitWebSocketClient, DeribitWsMessage},
        error::{DeribitErrorCategory, DeribitWsError},
        session::DeribitSessionInfo,
    },
};
