//! WebSocket client implementation for the Deribit JSON-RPC v2 API.
//!
//! This module provides the persistent, authenticated session core,
//! supporting:
//!
//! - Request/response correlation with per-method timeouts.
//! - Session lifecycle: auth, refresh, token exchange, token fork, logout.
//! - Adaptive token-bucket rate limiting with 429 backoff and recovery.
//! - Automatic reconnection with bootstrap replay and resubscription.
//! - Server-clock offset tracking.

pub mod client;
pub mod error;
pub mod messages;
pub mod rate_limit;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod time_sync;
pub mod transport;

// Re-exports
pub use crate::websocket::{
    client::{ConnectionInfo, DeribitWebSocketClient, DeribitWsMessage},
    error::{DeribitErrorCategory, DeribitWsError},
};
