//! WebSocket client for the Deribit JSON-RPC v2 API.
//!
//! The [`DeribitWebSocketClient`] is a cloneable handle onto a single
//! connection actor. The actor exclusively owns every piece of mutable
//! connection state (rate-limit bucket, in-flight request table, session
//! chain, order and subscription registries, reconnect counter) and serves a
//! typed command channel; callers on any thread are marshalled through it.
//!
//! Control flows that must await responses (bootstrap, resubscription) run as
//! spawned tasks that drive the actor through the same command channel, so
//! the actor itself never blocks on the network.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use ustr::Ustr;

use crate::{
    common::{
        consts::{
            HEARTBEAT_FLOOR_SECS, METHOD_AUTH, METHOD_DISABLE_COD, METHOD_ENABLE_COD,
            METHOD_GET_TIME, METHOD_HELLO, METHOD_LOGOUT, METHOD_SET_HEARTBEAT, METHOD_STATUS,
            METHOD_TEST, METHOD_UNSUBSCRIBE_ALL, REFRESH_RETRY_DELAY_SECS,
        },
        enums::{
            DeribitCodScope, DeribitConnectionState, DeribitOperationKind, DeribitOrderDirection,
            DeribitSessionTransition,
        },
        env::get_or_env_var,
    },
    config::DeribitClientConfig,
    websocket::{
        error::{DeribitWsError, is_rate_limit_code, requires_reauth},
        messages::{DeribitAuthResult, DeribitWsEvent, JsonRpcResponse, NotificationKind,
            SubscriptionParams},
        rate_limit::{Admission, AdaptiveRateLimiter, RateLimitSnapshot},
        registry::{Registry, SubscriptionRecord, ResubscribeOutcome, subscribe_method,
            unsubscribe_method},
        rpc::{self, Correlator, RequestIdGenerator, method_timeout_ms},
        session::{DeribitSessionInfo, SessionManager},
        time_sync::{TimeSync, TimeSyncInfo},
        transport::{CloseReason, Transport, TransportEvent},
    },
};

const RECONNECT_DELAY_BASE_MS: u64 = 1_000;
const RECONNECT_DELAY_MAX_MS: u64 = 30_000;

/// Messages pushed to the embedding application.
#[derive(Clone, Debug)]
pub enum DeribitWsMessage {
    /// A channel data delivery.
    Notification(SubscriptionParams),
    /// The connection was re-established and bootstrap completed.
    Reconnected,
    /// Resubscription retries were exhausted for the listed channels.
    ResubscriptionFailed { channels: Vec<Ustr> },
}

/// Point-in-time connection details for observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub state: DeribitConnectionState,
    pub reconnect_attempts: u32,
    /// Last heartbeat interval acknowledged by the server.
    pub heartbeat_interval_secs: Option<u64>,
    /// Last cancel-on-disconnect setting acknowledged by the server.
    pub cancel_on_disconnect: Option<(bool, DeribitCodScope)>,
}

type CallWaiter = oneshot::Sender<Result<Value, DeribitWsError>>;
type UnitWaiter = oneshot::Sender<Result<(), DeribitWsError>>;
type SessionWaiter = oneshot::Sender<Result<DeribitSessionInfo, DeribitWsError>>;

#[derive(Debug)]
enum Command {
    Connect {
        waiter: UnitWaiter,
    },
    Call {
        method: String,
        params: Value,
        timeout_ms: Option<u64>,
        waiter: CallWaiter,
    },
    Authenticate {
        waiter: SessionWaiter,
    },
    ExchangeToken {
        subject_id: u64,
        waiter: SessionWaiter,
    },
    ForkToken {
        session_name: String,
        waiter: SessionWaiter,
    },
    Logout {
        invalidate_token: bool,
        waiter: UnitWaiter,
    },
    Subscribe {
        channel: Ustr,
        params: Value,
        waiter: UnitWaiter,
    },
    Unsubscribe {
        channels: Vec<Ustr>,
        waiter: UnitWaiter,
    },
    UnsubscribeAll {
        waiter: UnitWaiter,
    },
    SetHeartbeat {
        interval_secs: u64,
        waiter: UnitWaiter,
    },
    EnableCod {
        scope: DeribitCodScope,
        waiter: UnitWaiter,
    },
    DisableCod {
        waiter: UnitWaiter,
    },
    RegisterOrder {
        order_id: String,
        instrument: Ustr,
        direction: DeribitOrderDirection,
        status: String,
        metadata: Value,
        waiter: UnitWaiter,
    },
    UpdateOrder {
        order_id: String,
        status: String,
        metadata: Option<Value>,
        waiter: UnitWaiter,
    },
    SessionInfo {
        reply: oneshot::Sender<Option<DeribitSessionInfo>>,
    },
    ConnectionInfo {
        reply: oneshot::Sender<ConnectionInfo>,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<SubscriptionRecord>>,
    },
    RateLimit {
        reply: oneshot::Sender<RateLimitSnapshot>,
    },
    TimeSyncInfo {
        reply: oneshot::Sender<TimeSyncInfo>,
    },
    Disconnect {
        waiter: UnitWaiter,
    },
    // Internal: control tasks report back through these.
    BeginResubscribe {
        reply: oneshot::Sender<Vec<(Ustr, Value)>>,
    },
    CompleteResubscribe {
        failed: Vec<Ustr>,
    },
    BootstrapComplete {
        success: bool,
        reconnect: bool,
    },
}

/// Routing context attached to every in-flight request.
#[derive(Debug)]
enum RequestContext {
    Plain {
        waiter: Option<CallWaiter>,
    },
    Auth {
        transition: DeribitSessionTransition,
        subject_id: Option<u64>,
        session_name: Option<String>,
        waiter: Option<SessionWaiter>,
    },
    /// Scheduled token refresh; no external waiter.
    Refresh,
    Subscribe {
        channel: Ustr,
        waiter: Option<UnitWaiter>,
    },
    Unsubscribe {
        channels: Vec<Ustr>,
        waiter: Option<UnitWaiter>,
    },
    UnsubscribeAll {
        waiter: Option<UnitWaiter>,
    },
    SetHeartbeat {
        interval_secs: u64,
        waiter: Option<UnitWaiter>,
    },
    Cod {
        enabled: bool,
        scope: Option<DeribitCodScope>,
        waiter: Option<UnitWaiter>,
    },
    Logout {
        waiter: Option<UnitWaiter>,
    },
    /// Periodic time-sync probe; the sample is applied by the response path.
    TimeProbe,
}

impl RequestContext {
    /// Resolves the attached waiter, if any, with `error`.
    fn fail(self, error: DeribitWsError) {
        match self {
            Self::Plain { waiter } => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(error));
                }
            }
            Self::Auth { waiter, .. } => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(error));
                }
            }
            Self::Subscribe { waiter, .. }
            | Self::Unsubscribe { waiter, .. }
            | Self::UnsubscribeAll { waiter }
            | Self::SetHeartbeat { waiter, .. }
            | Self::Cod { waiter, .. }
            | Self::Logout { waiter } => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(error));
                }
            }
            Self::Refresh | Self::TimeProbe => {}
        }
    }
}

/// An admitted-later request parked by the rate limiter.
#[derive(Debug)]
struct ParkedJob {
    retry_at: Instant,
    job: SendJob,
}

#[derive(Debug)]
struct SendJob {
    method: String,
    params: Value,
    timeout_ms: Option<u64>,
    context: RequestContext,
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay_ms = RECONNECT_DELAY_BASE_MS
        .saturating_mul(1u64 << exp)
        .min(RECONNECT_DELAY_MAX_MS);
    Duration::from_millis(delay_ms)
}

fn state_to_u8(state: DeribitConnectionState) -> u8 {
    match state {
        DeribitConnectionState::Disconnected => 0,
        DeribitConnectionState::Connecting => 1,
        DeribitConnectionState::Connected => 2,
        DeribitConnectionState::Authenticating => 3,
        DeribitConnectionState::Authenticated => 4,
        DeribitConnectionState::Reconnecting => 5,
        DeribitConnectionState::Closed => 6,
    }
}

fn state_from_u8(value: u8) -> DeribitConnectionState {
    match value {
        1 => DeribitConnectionState::Connecting,
        2 => DeribitConnectionState::Connected,
        3 => DeribitConnectionState::Authenticating,
        4 => DeribitConnectionState::Authenticated,
        5 => DeribitConnectionState::Reconnecting,
        6 => DeribitConnectionState::Closed,
        _ => DeribitConnectionState::Disconnected,
    }
}

fn response_to_result(response: JsonRpcResponse) -> Result<Value, DeribitWsError> {
    if let Some(error) = response.error {
        Err(DeribitWsError::from_rpc_error(error.code, error.message))
    } else if let Some(result) = response.result {
        Ok(result)
    } else {
        Err(DeribitWsError::InvalidResponse(
            "response carries neither result nor error".to_string(),
        ))
    }
}

fn wall_now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Provides a WebSocket client for connecting to [Deribit](https://www.deribit.com).
#[derive(Clone, Debug)]
pub struct DeribitWebSocketClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_cell: Arc<AtomicU8>,
    msg_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<DeribitWsMessage>>>>,
    cancellation_token: CancellationToken,
}

impl DeribitWebSocketClient {
    /// Creates a new client and spawns its connection actor.
    ///
    /// # Errors
    ///
    /// Returns an error when credential material is partially configured.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: DeribitClientConfig) -> anyhow::Result<Self> {
        // Partial credentials are a configuration mistake; surface it here
        // rather than at the first authenticate call.
        if (config.api_key.is_some() || config.client_id.is_some()) != config.api_secret.is_some()
        {
            anyhow::bail!("`api_key`/`client_id` and `api_secret` must be provided together");
        }

        let url = config.ws_url();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let state_cell = Arc::new(AtomicU8::new(state_to_u8(
            DeribitConnectionState::Disconnected,
        )));
        let cancellation_token = CancellationToken::new();

        let actor = ClientActor::new(
            config,
            url.clone(),
            cmd_tx.clone(),
            msg_tx,
            state_cell.clone(),
            cancellation_token.clone(),
        );
        tokio::spawn(actor.run(cmd_rx));

        Ok(Self {
            url,
            cmd_tx,
            state_cell,
            msg_rx: Arc::new(Mutex::new(Some(msg_rx))),
            cancellation_token,
        })
    }

    /// Creates an authenticated client, falling back to the environment for
    /// missing credential values.
    ///
    /// # Errors
    ///
    /// Returns an error when credential values cannot be loaded from either
    /// source.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_credentials(
        api_key: Option<String>,
        api_secret: Option<String>,
        host: Option<String>,
    ) -> anyhow::Result<Self> {
        let api_key = get_or_env_var(api_key, "DERIBIT_CLIENT_ID")?;
        let api_secret = get_or_env_var(api_secret, "DERIBIT_CLIENT_SECRET")?;
        let config = DeribitClientConfig {
            api_key: Some(api_key),
            api_secret: Some(api_secret),
            host,
            ..Default::default()
        };
        Self::new(config)
    }

    /// Creates a client from environment variables (`DERIBIT_*`).
    ///
    /// # Errors
    ///
    /// Returns an error when credential material is partially configured.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(DeribitClientConfig::from_env())
    }

    /// Returns the websocket url being used by the client.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> DeribitConnectionState {
        state_from_u8(self.state_cell.load(Ordering::Relaxed))
    }

    /// Returns a value indicating whether the connection is usable.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self.connection_state(),
            DeribitConnectionState::Connected
                | DeribitConnectionState::Authenticating
                | DeribitConnectionState::Authenticated
        )
    }

    /// Takes the push-message stream; subsequent calls return `None`.
    #[must_use]
    pub fn take_message_stream(&self) -> Option<mpsc::UnboundedReceiver<DeribitWsMessage>> {
        self.msg_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Cancels the actor and every in-flight request.
    pub fn cancel_all_requests(&self) {
        self.cancellation_token.cancel();
    }

    /// Get the cancellation token for this client.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    fn send_command(&self, command: Command) -> Result<(), DeribitWsError> {
        self.cmd_tx
            .send(command)
            .map_err(|_| DeribitWsError::ConnectionClosed)
    }

    async fn await_waiter<T>(
        rx: oneshot::Receiver<Result<T, DeribitWsError>>,
    ) -> Result<T, DeribitWsError> {
        rx.await.map_err(|_| DeribitWsError::Cancelled)?
    }

    /// Connects the transport and runs the bootstrap sequence.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the socket cannot be opened, or a
    /// [`DeribitWsError::Bootstrap`] naming the step that failed.
    pub async fn connect(&self) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::Connect { waiter })?;
        Self::await_waiter(rx).await
    }

    /// Issues a JSON-RPC call and awaits the matched response.
    ///
    /// # Errors
    ///
    /// Returns the classified RPC error, a timeout, a rate-limit rejection,
    /// or a connection-closed error.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, DeribitWsError> {
        self.call_with_timeout(method, params, None).await
    }

    /// As [`Self::call`] with a per-call timeout override (non-reserved
    /// methods only).
    ///
    /// # Errors
    ///
    /// See [`Self::call`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::Call {
            method: method.to_string(),
            params,
            timeout_ms,
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Authenticates with the configured credentials.
    ///
    /// # Errors
    ///
    /// Returns `MissingApiKey`/`MissingApiSecret` when credentials are not
    /// configured, or the classified auth failure.
    pub async fn authenticate(&self) -> Result<DeribitSessionInfo, DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::Authenticate { waiter })?;
        Self::await_waiter(rx).await
    }

    /// Switches the session to a subaccount via `grant_type=exchange_token`.
    ///
    /// # Errors
    ///
    /// Returns an error when no session is active or the grant is rejected.
    pub async fn exchange_token(
        &self,
        subject_id: u64,
    ) -> Result<DeribitSessionInfo, DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::ExchangeToken { subject_id, waiter })?;
        Self::await_waiter(rx).await
    }

    /// Forks the session under a new name via `grant_type=fork_token`.
    ///
    /// # Errors
    ///
    /// Returns an error when no session is active or the grant is rejected.
    pub async fn fork_token(
        &self,
        session_name: &str,
    ) -> Result<DeribitSessionInfo, DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::ForkToken {
            session_name: session_name.to_string(),
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Logs out, invalidating the tokens by default, and closes the
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns the classified RPC error when the server rejects the logout.
    pub async fn logout(&self, invalidate_token: bool) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::Logout {
            invalidate_token,
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Subscribes to a channel, routing by the channel privacy rule.
    ///
    /// # Errors
    ///
    /// Returns an error when the server rejects or fails to confirm the
    /// subscription.
    pub async fn subscribe(&self, channel: &str, params: Value) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            channel: Ustr::from(channel),
            params,
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Unsubscribes a batch; one private channel routes the whole batch
    /// through `private/unsubscribe`.
    ///
    /// # Errors
    ///
    /// Returns an error when the server rejects the request.
    pub async fn unsubscribe(&self, channels: &[&str]) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            channels: channels.iter().copied().map(Ustr::from).collect(),
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Drops every subscription via `public/unsubscribe_all`.
    ///
    /// # Errors
    ///
    /// Returns an error when the server does not acknowledge with `"ok"`.
    pub async fn unsubscribe_all(&self) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::UnsubscribeAll { waiter })?;
        Self::await_waiter(rx).await
    }

    /// Requests server heartbeats; `interval_secs` is floored to 10.
    ///
    /// # Errors
    ///
    /// Returns an error when the server rejects the request.
    pub async fn set_heartbeat(&self, interval_secs: u64) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::SetHeartbeat {
            interval_secs,
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Enables cancel-on-disconnect for the given scope.
    ///
    /// # Errors
    ///
    /// Returns an error when the server rejects the request.
    pub async fn enable_cancel_on_disconnect(
        &self,
        scope: DeribitCodScope,
    ) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::EnableCod { scope, waiter })?;
        Self::await_waiter(rx).await
    }

    /// Disables cancel-on-disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when the server rejects the request.
    pub async fn disable_cancel_on_disconnect(&self) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::DisableCod { waiter })?;
        Self::await_waiter(rx).await
    }

    /// Registers an externally created order against the active session.
    ///
    /// # Errors
    ///
    /// Returns an error when no session is active.
    pub async fn register_order(
        &self,
        order_id: &str,
        instrument: &str,
        direction: DeribitOrderDirection,
        status: &str,
        metadata: Value,
    ) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::RegisterOrder {
            order_id: order_id.to_string(),
            instrument: Ustr::from(instrument),
            direction,
            status: status.to_string(),
            metadata,
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Updates a tracked order.
    ///
    /// # Errors
    ///
    /// Returns a client error when the order id is unknown.
    pub async fn update_order(
        &self,
        order_id: &str,
        status: &str,
        metadata: Option<Value>,
    ) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::UpdateOrder {
            order_id: order_id.to_string(),
            status: status.to_string(),
            metadata,
            waiter,
        })?;
        Self::await_waiter(rx).await
    }

    /// Snapshot of the active session, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::ConnectionClosed`] when the actor is gone.
    pub async fn session_info(&self) -> Result<Option<DeribitSessionInfo>, DeribitWsError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SessionInfo { reply })?;
        rx.await.map_err(|_| DeribitWsError::ConnectionClosed)
    }

    /// Snapshot of tracked subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::ConnectionClosed`] when the actor is gone.
    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionRecord>, DeribitWsError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Subscriptions { reply })?;
        rx.await.map_err(|_| DeribitWsError::ConnectionClosed)
    }

    /// Snapshot of connection details (state, reconnect attempts, last
    /// acknowledged heartbeat and cancel-on-disconnect settings).
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::ConnectionClosed`] when the actor is gone.
    pub async fn connection_info(&self) -> Result<ConnectionInfo, DeribitWsError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::ConnectionInfo { reply })?;
        rx.await.map_err(|_| DeribitWsError::ConnectionClosed)
    }

    /// Snapshot of the adaptive rate limiter.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::ConnectionClosed`] when the actor is gone.
    pub async fn rate_limit_snapshot(&self) -> Result<RateLimitSnapshot, DeribitWsError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::RateLimit { reply })?;
        rx.await.map_err(|_| DeribitWsError::ConnectionClosed)
    }

    /// Snapshot of the time-sync service.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::ConnectionClosed`] when the actor is gone.
    pub async fn time_sync_info(&self) -> Result<TimeSyncInfo, DeribitWsError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::TimeSyncInfo { reply })?;
        rx.await.map_err(|_| DeribitWsError::ConnectionClosed)
    }

    /// Closes the connection gracefully; no reconnect follows.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::ConnectionClosed`] when the actor is gone.
    pub async fn disconnect(&self) -> Result<(), DeribitWsError> {
        let (waiter, rx) = oneshot::channel();
        self.send_command(Command::Disconnect { waiter })?;
        Self::await_waiter(rx).await
    }

    // Convenience wrappers over the bootstrap RPCs.

    /// Sends `public/test`.
    ///
    /// # Errors
    ///
    /// See [`Self::call`].
    pub async fn test(&self) -> Result<Value, DeribitWsError> {
        self.call(METHOD_TEST, json!({})).await
    }

    /// Sends `public/get_time` and returns the server time in milliseconds.
    ///
    /// # Errors
    ///
    /// See [`Self::call`]; also fails when the result is not an integer.
    pub async fn get_time(&self) -> Result<i64, DeribitWsError> {
        let value = self.call(METHOD_GET_TIME, json!({})).await?;
        value.as_i64().ok_or_else(|| {
            DeribitWsError::InvalidResponse("get_time result is not an integer".to_string())
        })
    }

    /// Sends `public/status`.
    ///
    /// # Errors
    ///
    /// See [`Self::call`].
    pub async fn status(&self) -> Result<Value, DeribitWsError> {
        self.call(METHOD_STATUS, json!({})).await
    }
}

// -------------------------------------------------------------------------
// Connection actor
// -------------------------------------------------------------------------

enum Step {
    Cmd(Option<Command>),
    Event(Option<TransportEvent>),
    Timer,
    Cancelled,
}

struct ClientActor {
    config: DeribitClientConfig,
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    msg_tx: mpsc::UnboundedSender<DeribitWsMessage>,
    state: DeribitConnectionState,
    state_cell: Arc<AtomicU8>,
    cancellation: CancellationToken,
    ids: RequestIdGenerator,
    start: Instant,
    transport: Option<Transport>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    correlator: Correlator<RequestContext>,
    limiter: AdaptiveRateLimiter,
    session: SessionManager,
    registry: Registry,
    time_sync: TimeSync,
    parked: VecDeque<ParkedJob>,
    reconnect_attempts: u32,
    reconnect_authenticate: bool,
    resubscribing: bool,
    refresh_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    time_sync_at: Option<Instant>,
    last_heartbeat_secs: Option<u64>,
    cod_state: Option<(bool, DeribitCodScope)>,
}

impl ClientActor {
    fn new(
        config: DeribitClientConfig,
        url: String,
        cmd_tx: mpsc::UnboundedSender<Command>,
        msg_tx: mpsc::UnboundedSender<DeribitWsMessage>,
        state_cell: Arc<AtomicU8>,
        cancellation: CancellationToken,
    ) -> Self {
        let start = Instant::now();
        let limiter = AdaptiveRateLimiter::new(config.rate_limit_mode, 0);
        let session = SessionManager::new(config.effective_refresh_threshold_secs());
        let registry = Registry::new(config.resubscribe_max_retries);
        let time_sync = TimeSync::new(config.time_sync_interval_ms);

        Self {
            config,
            url,
            cmd_tx,
            msg_tx,
            state: DeribitConnectionState::Disconnected,
            state_cell,
            cancellation,
            ids: RequestIdGenerator::new(),
            start,
            transport: None,
            events_rx: None,
            correlator: Correlator::new(),
            limiter,
            session,
            registry,
            time_sync,
            parked: VecDeque::new(),
            reconnect_attempts: 0,
            reconnect_authenticate: false,
            resubscribing: false,
            refresh_at: None,
            reconnect_at: None,
            time_sync_at: None,
            last_heartbeat_secs: None,
            cod_state: None,
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn set_state(&mut self, state: DeribitConnectionState) {
        self.state = state;
        self.state_cell.store(state_to_u8(state), Ordering::Relaxed);
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let cancellation = self.cancellation.clone();
        loop {
            let timer = self.next_timer();
            let sleep_deadline =
                timer.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            let step = tokio::select! {
                () = cancellation.cancelled() => Step::Cancelled,
                maybe_cmd = cmd_rx.recv() => Step::Cmd(maybe_cmd),
                maybe_event = async {
                    match self.events_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => Step::Event(maybe_event),
                () = tokio::time::sleep_until(sleep_deadline), if timer.is_some() => Step::Timer,
            };

            match step {
                Step::Cmd(Some(command)) => self.handle_command(command).await,
                Step::Cmd(None) | Step::Cancelled => {
                    self.shutdown();
                    break;
                }
                Step::Event(Some(event)) => self.handle_transport_event(event),
                Step::Event(None) => self.events_rx = None,
                Step::Timer => self.handle_timers().await,
            }

            if self.state == DeribitConnectionState::Closed && self.transport.is_none() {
                // Keep serving snapshot queries until the handles go away,
                // but nothing further is scheduled.
                self.refresh_at = None;
                self.reconnect_at = None;
                self.time_sync_at = None;
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, pending) in self.correlator.drain_all() {
            pending.context.fail(DeribitWsError::ConnectionClosed);
        }
        for parked in self.parked.drain(..) {
            parked.job.context.fail(DeribitWsError::ConnectionClosed);
        }
        if let Some(transport) = self.transport.take() {
            transport.abort();
        }
        self.set_state(DeribitConnectionState::Closed);
    }

    fn next_timer(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |candidate: Option<Instant>| {
            if let Some(candidate) = candidate {
                next = Some(next.map_or(candidate, |current| current.min(candidate)));
            }
        };
        consider(self.refresh_at);
        consider(self.reconnect_at);
        consider(self.time_sync_at);
        consider(self.parked.front().map(|p| p.retry_at));
        consider(
            self.correlator
                .next_deadline_ms()
                .map(|ms| self.start + Duration::from_millis(ms)),
        );
        next
    }

    // -- Command handling --------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { waiter } => self.handle_connect(Some(waiter)).await,
            Command::Call {
                method,
                params,
                timeout_ms,
                waiter,
            } => self.dispatch(SendJob {
                method,
                params,
                timeout_ms,
                context: RequestContext::Plain {
                    waiter: Some(waiter),
                },
            }),
            Command::Authenticate { waiter } => self.handle_authenticate(waiter),
            Command::ExchangeToken { subject_id, waiter } => {
                self.handle_exchange_token(subject_id, waiter);
            }
            Command::ForkToken {
                session_name,
                waiter,
            } => self.handle_fork_token(session_name, waiter),
            Command::Logout {
                invalidate_token,
                waiter,
            } => self.dispatch(SendJob {
                method: METHOD_LOGOUT.to_string(),
                params: json!({ "invalidate_token": invalidate_token }),
                timeout_ms: None,
                context: RequestContext::Logout {
                    waiter: Some(waiter),
                },
            }),
            Command::Subscribe {
                channel,
                params,
                waiter,
            } => self.handle_subscribe(channel, params, Some(waiter)),
            Command::Unsubscribe { channels, waiter } => {
                self.handle_unsubscribe(channels, Some(waiter));
            }
            Command::UnsubscribeAll { waiter } => self.dispatch(SendJob {
                method: METHOD_UNSUBSCRIBE_ALL.to_string(),
                params: json!({}),
                timeout_ms: None,
                context: RequestContext::UnsubscribeAll {
                    waiter: Some(waiter),
                },
            }),
            Command::SetHeartbeat {
                interval_secs,
                waiter,
            } => {
                let interval_secs = interval_secs.max(HEARTBEAT_FLOOR_SECS);
                self.dispatch(SendJob {
                    method: METHOD_SET_HEARTBEAT.to_string(),
                    params: json!({ "interval": interval_secs }),
                    timeout_ms: None,
                    context: RequestContext::SetHeartbeat {
                        interval_secs,
                        waiter: Some(waiter),
                    },
                });
            }
            Command::EnableCod { scope, waiter } => self.dispatch(SendJob {
                method: METHOD_ENABLE_COD.to_string(),
                params: json!({ "scope": scope }),
                timeout_ms: None,
                context: RequestContext::Cod {
                    enabled: true,
                    scope: Some(scope),
                    waiter: Some(waiter),
                },
            }),
            Command::DisableCod { waiter } => self.dispatch(SendJob {
                method: METHOD_DISABLE_COD.to_string(),
                params: json!({}),
                timeout_ms: None,
                context: RequestContext::Cod {
                    enabled: false,
                    scope: None,
                    waiter: Some(waiter),
                },
            }),
            Command::RegisterOrder {
                order_id,
                instrument,
                direction,
                status,
                metadata,
                waiter,
            } => {
                let outcome = self
                    .registry
                    .register_order(order_id, instrument, direction, status, metadata,
                        wall_now_ms())
                    .map_err(|order_id| {
                        DeribitWsError::ClientError(format!(
                            "no active session to register order {order_id}"
                        ))
                    });
                let _ = waiter.send(outcome);
            }
            Command::UpdateOrder {
                order_id,
                status,
                metadata,
                waiter,
            } => {
                let outcome = self
                    .registry
                    .update_order(&order_id, status, metadata, wall_now_ms())
                    .map(|_| ())
                    .map_err(|order_id| {
                        DeribitWsError::ClientError(format!("order not found: {order_id}"))
                    });
                let _ = waiter.send(outcome);
            }
            Command::SessionInfo { reply } => {
                let _ = reply.send(self.session.active().map(DeribitSessionInfo::from));
            }
            Command::ConnectionInfo { reply } => {
                let _ = reply.send(ConnectionInfo {
                    state: self.state,
                    reconnect_attempts: self.reconnect_attempts,
                    heartbeat_interval_secs: self.last_heartbeat_secs,
                    cancel_on_disconnect: self.cod_state,
                });
            }
            Command::Subscriptions { reply } => {
                let _ = reply.send(self.registry.subscriptions().cloned().collect());
            }
            Command::RateLimit { reply } => {
                let _ = reply.send(self.limiter.snapshot());
            }
            Command::TimeSyncInfo { reply } => {
                let _ = reply.send(self.time_sync.sync_info());
            }
            Command::Disconnect { waiter } => {
                tracing::info!(target: "deribit_client", "client.disconnect");
                self.reconnect_at = None;
                match &self.transport {
                    Some(transport) => transport.close(),
                    None => self.set_state(DeribitConnectionState::Closed),
                }
                let _ = waiter.send(Ok(()));
            }
            Command::BeginResubscribe { reply } => {
                let _ = reply.send(self.registry.begin_resubscription());
            }
            Command::CompleteResubscribe { failed } => self.handle_resubscribe_complete(failed),
            Command::BootstrapComplete { success, reconnect } => {
                self.handle_bootstrap_complete(success, reconnect);
            }
        }
    }

    async fn handle_connect(&mut self, waiter: Option<UnitWaiter>) {
        if self.transport.is_some() {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(DeribitWsError::ClientError(
                    "already connected".to_string(),
                )));
            }
            return;
        }

        self.set_state(DeribitConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match Transport::connect(&self.url, self.ids.clone(), events_tx).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.events_rx = Some(events_rx);
                self.reconnect_at = None;
                let reconnect = self.reconnect_attempts > 0;
                self.reconnect_attempts = 0;
                self.set_state(DeribitConnectionState::Connected);
                tracing::info!(
                    target: "deribit_client",
                    url = %self.url,
                    reconnect,
                    "connection.opened",
                );
                self.spawn_bootstrap(waiter, reconnect);
            }
            Err(e) => {
                tracing::warn!(
                    target: "deribit_client",
                    url = %self.url,
                    error = %e,
                    "client.connect.failure",
                );
                self.set_state(DeribitConnectionState::Disconnected);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(e));
                } else {
                    // Reconnect attempt failed; keep trying within budget.
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn spawn_bootstrap(&mut self, waiter: Option<UnitWaiter>, reconnect: bool) {
        let cmd_tx = self.cmd_tx.clone();
        let config = self.config.clone();
        let authenticate =
            config.authenticate || (reconnect && self.reconnect_authenticate);
        self.reconnect_authenticate = false;

        tokio::spawn(async move {
            let result = run_bootstrap(&cmd_tx, &config, authenticate).await;
            match &result {
                Ok(()) => tracing::info!(target: "deribit_client", "client.bootstrap.success"),
                Err(e) => tracing::warn!(
                    target: "deribit_client",
                    error = %e,
                    "client.bootstrap.failure",
                ),
            }
            let _ = cmd_tx.send(Command::BootstrapComplete {
                success: result.is_ok(),
                reconnect,
            });
            if let Some(waiter) = waiter {
                let _ = waiter.send(result);
            }
        });
    }

    fn handle_bootstrap_complete(&mut self, success: bool, reconnect: bool) {
        if success {
            if self.config.time_sync_enabled {
                let interval = self.time_sync.sync_interval_ms();
                // The bootstrap get_time was the immediate initial tick.
                self.time_sync_at = Some(Instant::now() + Duration::from_millis(interval));
                tracing::debug!(
                    target: "deribit_client",
                    interval_ms = interval,
                    "time_sync.start",
                );
            }
            if reconnect {
                let _ = self.msg_tx.send(DeribitWsMessage::Reconnected);
            }
        }
    }

    fn handle_authenticate(&mut self, waiter: SessionWaiter) {
        match self.config.credential() {
            Ok(credential) => {
                if self.state == DeribitConnectionState::Connected {
                    self.set_state(DeribitConnectionState::Authenticating);
                }
                let params = SessionManager::client_credentials_params(&credential);
                self.dispatch(SendJob {
                    method: METHOD_AUTH.to_string(),
                    params,
                    timeout_ms: None,
                    context: RequestContext::Auth {
                        transition: DeribitSessionTransition::Initial,
                        subject_id: None,
                        session_name: None,
                        waiter: Some(waiter),
                    },
                });
            }
            Err(e) => {
                tracing::warn!(target: "deribit_client", error = %e, "auth.failure");
                let _ = waiter.send(Err(e));
            }
        }
    }

    fn handle_exchange_token(&mut self, subject_id: u64, waiter: SessionWaiter) {
        let Some(refresh_token) = self.session.refresh_token().map(str::to_string) else {
            let _ = waiter.send(Err(DeribitWsError::ClientError(
                "no active session to exchange".to_string(),
            )));
            return;
        };
        let params = SessionManager::exchange_params(&refresh_token, subject_id);
        self.dispatch(SendJob {
            method: METHOD_AUTH.to_string(),
            params,
            timeout_ms: None,
            context: RequestContext::Auth {
                transition: DeribitSessionTransition::Exchange,
                subject_id: Some(subject_id),
                session_name: None,
                waiter: Some(waiter),
            },
        });
    }

    fn handle_fork_token(&mut self, session_name: String, waiter: SessionWaiter) {
        let Some(refresh_token) = self.session.refresh_token().map(str::to_string) else {
            let _ = waiter.send(Err(DeribitWsError::ClientError(
                "no active session to fork".to_string(),
            )));
            return;
        };
        let params = SessionManager::fork_params(&refresh_token, &session_name);
        self.dispatch(SendJob {
            method: METHOD_AUTH.to_string(),
            params,
            timeout_ms: None,
            context: RequestContext::Auth {
                transition: DeribitSessionTransition::Fork,
                subject_id: None,
                session_name: Some(session_name),
                waiter: Some(waiter),
            },
        });
    }

    fn handle_subscribe(&mut self, channel: Ustr, params: Value, waiter: Option<UnitWaiter>) {
        self.registry.mark_pending(channel, params.clone());
        let mut request = json!({ "channels": [channel.as_str()] });
        if let (Some(object), Some(extra)) = (request.as_object_mut(), params.as_object()) {
            for (key, value) in extra {
                object.insert(key.clone(), value.clone());
            }
        }
        self.dispatch(SendJob {
            method: subscribe_method(channel.as_str()).to_string(),
            params: request,
            timeout_ms: None,
            context: RequestContext::Subscribe { channel, waiter },
        });
    }

    fn handle_unsubscribe(&mut self, channels: Vec<Ustr>, waiter: Option<UnitWaiter>) {
        let names: Vec<&str> = channels.iter().map(Ustr::as_str).collect();
        self.dispatch(SendJob {
            method: unsubscribe_method(&channels).to_string(),
            params: json!({ "channels": names }),
            timeout_ms: None,
            context: RequestContext::Unsubscribe { channels, waiter },
        });
    }

    // -- Outbound path -----------------------------------------------------

    fn dispatch(&mut self, job: SendJob) {
        if self.transport.is_none() {
            job.context.fail(DeribitWsError::ConnectionClosed);
            return;
        }

        let kind = DeribitOperationKind::infer(&job.method);
        match self.limiter.check(kind, self.now_ms()) {
            Admission::Allow => self.send_now(job),
            Admission::Queue { retry_after_ms } => {
                if self.limiter.try_enqueue() {
                    self.parked.push_back(ParkedJob {
                        retry_at: Instant::now() + Duration::from_millis(retry_after_ms),
                        job,
                    });
                } else {
                    self.fail_rate_limited(job, retry_after_ms);
                }
            }
            Admission::Reject { retry_after_ms } => {
                self.fail_rate_limited(job, retry_after_ms);
            }
        }
    }

    fn fail_rate_limited(&mut self, job: SendJob, retry_after_ms: u64) {
        // A dropped refresh would quietly let the token expire; route it
        // through the refresh failure path so the retry is armed.
        if matches!(job.context, RequestContext::Refresh) {
            self.on_refresh_failure(&DeribitWsError::RateLimited { retry_after_ms });
        } else {
            job.context
                .fail(DeribitWsError::RateLimited { retry_after_ms });
        }
    }

    fn send_now(&mut self, job: SendJob) {
        let SendJob {
            method,
            params,
            timeout_ms,
            context,
        } = job;

        let id = self.ids.next_id();
        let token = self.session.access_token().map(str::to_string);
        let request = match rpc::encode_request(id, &method, params, token.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                context.fail(e);
                return;
            }
        };
        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(e) => {
                context.fail(e.into());
                return;
            }
        };

        let timeout = method_timeout_ms(&method, timeout_ms);
        self.correlator
            .track(id, method.clone(), context, self.now_ms(), timeout);

        let send_outcome = self
            .transport
            .as_ref()
            .map(|transport| transport.send_text(payload));
        match send_outcome {
            Some(Ok(())) => {
                tracing::debug!(
                    target: "deribit_client",
                    id,
                    method = %method,
                    timeout_ms = timeout,
                    "rpc.request",
                );
            }
            Some(Err(e)) => {
                if let Some(pending) = self.correlator.settle(id) {
                    pending.context.fail(e);
                }
            }
            None => {
                if let Some(pending) = self.correlator.settle(id) {
                    pending.context.fail(DeribitWsError::ConnectionClosed);
                }
            }
        }
    }

    // -- Inbound path ------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Event(DeribitWsEvent::Response(response)) => {
                self.handle_response(response);
            }
            TransportEvent::Event(DeribitWsEvent::Notification(notification)) => {
                match notification.kind() {
                    NotificationKind::Subscription(params) => {
                        let _ = self.msg_tx.send(DeribitWsMessage::Notification(params));
                    }
                    kind => tracing::debug!(
                        target: "deribit_client",
                        kind = ?kind,
                        "Ignoring unhandled notification",
                    ),
                }
            }
            TransportEvent::ParseError(error) => {
                // Connection is kept; the bad frame is observability-only.
                tracing::warn!(
                    target: "deribit_client",
                    error = %error,
                    "rpc.invalid_response",
                );
            }
            TransportEvent::Closed(reason) => self.handle_close(reason),
        }
    }

    fn handle_response(&mut self, response: JsonRpcResponse) {
        let response_id = response.id;
        let Some(pending) = self.correlator.settle(response_id) else {
            tracing::trace!(
                target: "deribit_client",
                id = response_id,
                "Ignoring response for unknown id",
            );
            return;
        };

        let duration_ms = self.now_ms().saturating_sub(pending.sent_at_ms);
        if let Some(error) = &response.error {
            tracing::debug!(
                target: "deribit_client",
                id = response_id,
                method = %pending.method,
                code = error.code,
                duration_ms,
                "rpc.error_response",
            );
            // A throttling response always feeds the limiter, even when it
            // also settles an in-flight waiter.
            if is_rate_limit_code(error.code) {
                self.limiter.on_rate_limit_hit(self.now_ms());
            }
            if requires_reauth(error.code)
                && self.state == DeribitConnectionState::Authenticated
                && !matches!(pending.context, RequestContext::Auth { .. })
            {
                tracing::warn!(
                    target: "deribit_client",
                    code = error.code,
                    "connection.auth_error_reconnect",
                );
                self.force_reconnect_with_auth();
            }
        } else {
            tracing::trace!(
                target: "deribit_client",
                id = response_id,
                method = %pending.method,
                duration_ms,
                "rpc.response",
            );
        }

        // Any timed get_time response refreshes the clock offset.
        if pending.method == METHOD_GET_TIME
            && let Some(server_ms) = response.result.as_ref().and_then(Value::as_i64)
        {
            let now_mono = self.now_ms();
            let t1_wall = wall_now_ms() as i64;
            let t0_wall = t1_wall - (now_mono.saturating_sub(pending.sent_at_ms)) as i64;
            self.time_sync.apply_sample(t0_wall, t1_wall, server_ms);
        }

        let outcome = response_to_result(response);
        match pending.context {
            RequestContext::Plain { waiter } => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(outcome);
                }
            }
            RequestContext::Auth {
                transition,
                subject_id,
                session_name,
                waiter,
            } => self.handle_auth_outcome(transition, subject_id, session_name, waiter, outcome),
            RequestContext::Refresh => match outcome {
                Ok(value) => match serde_json::from_value::<DeribitAuthResult>(value) {
                    Ok(auth) => {
                        self.session.apply_auth(
                            &auth,
                            DeribitSessionTransition::Refresh,
                            None,
                            None,
                            wall_now_ms(),
                        );
                        self.arm_refresh_timer();
                    }
                    Err(e) => self.on_refresh_failure(&DeribitWsError::from(e)),
                },
                Err(e) => self.on_refresh_failure(&e),
            },
            RequestContext::Subscribe { channel, waiter } => match outcome {
                Ok(value) => {
                    let confirmed: Vec<String> =
                        serde_json::from_value(value).unwrap_or_default();
                    if confirmed.iter().any(|name| name == channel.as_str()) {
                        self.registry.confirm(&channel);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(Ok(()));
                        }
                    } else if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(DeribitWsError::ClientError(format!(
                            "subscription not confirmed: {channel}"
                        ))));
                    }
                }
                Err(e) => {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(e));
                    }
                }
            },
            RequestContext::Unsubscribe { channels, waiter } => match outcome {
                Ok(_) => {
                    self.registry.remove(&channels);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Err(e) => {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(e));
                    }
                }
            },
            RequestContext::UnsubscribeAll { waiter } => match outcome {
                Ok(value) if value == json!("ok") => {
                    self.registry.clear_subscriptions();
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Ok(other) => {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(DeribitWsError::InvalidResponse(format!(
                            "unexpected unsubscribe_all result: {other}"
                        ))));
                    }
                }
                Err(e) => {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(e));
                    }
                }
            },
            RequestContext::SetHeartbeat {
                interval_secs,
                waiter,
            } => match outcome {
                Ok(_) => {
                    self.last_heartbeat_secs = Some(interval_secs);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Err(e) => {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(e));
                    }
                }
            },
            RequestContext::Cod {
                enabled,
                scope,
                waiter,
            } => match outcome {
                Ok(_) => {
                    let scope = scope
                        .or(self.cod_state.map(|(_, s)| s))
                        .unwrap_or(self.config.cod_scope);
                    self.cod_state = Some((enabled, scope));
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Err(e) => {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(e));
                    }
                }
            },
            RequestContext::Logout { waiter } => match outcome {
                Ok(_) => {
                    self.session.invalidate();
                    self.refresh_at = None;
                    tracing::info!(target: "deribit_client", "client.logout.success");
                    if let Some(transport) = &self.transport {
                        transport.close();
                    }
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "deribit_client", error = %e, "client.logout.failure");
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(e));
                    }
                }
            },
            RequestContext::TimeProbe => {
                if let Err(e) = outcome {
                    self.time_sync.on_failure(&e.to_string());
                }
            }
        }
    }

    fn handle_auth_outcome(
        &mut self,
        transition: DeribitSessionTransition,
        subject_id: Option<u64>,
        session_name: Option<String>,
        waiter: Option<SessionWaiter>,
        outcome: Result<Value, DeribitWsError>,
    ) {
        let auth = match outcome.and_then(|value| {
            serde_json::from_value::<DeribitAuthResult>(value).map_err(DeribitWsError::from)
        }) {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(
                    target: "deribit_client",
                    transition = %transition,
                    error = %e,
                    "auth.failure",
                );
                if self.state == DeribitConnectionState::Authenticating {
                    self.set_state(DeribitConnectionState::Connected);
                }
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(e));
                }
                return;
            }
        };

        let prev_id = self.session.active().map(|s| s.id);
        let info = self
            .session
            .apply_auth(&auth, transition, subject_id, session_name, wall_now_ms());

        match transition {
            DeribitSessionTransition::Exchange | DeribitSessionTransition::Fork => {
                self.registry.on_session_transition(prev_id, info.id);
            }
            _ => self.registry.set_active_session(info.id),
        }

        self.set_state(DeribitConnectionState::Authenticated);
        self.arm_refresh_timer();
        tracing::info!(
            target: "deribit_client",
            session_id = info.id,
            transition = %transition,
            scope = %info.scope,
            "auth.success",
        );

        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(info));
        }
        self.maybe_start_resubscribe();
    }

    // -- Timers ------------------------------------------------------------

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            tracing::info!(
                target: "deribit_client",
                attempt = self.reconnect_attempts,
                "Attempting reconnect",
            );
            self.handle_connect(None).await;
        }

        if self.refresh_at.is_some_and(|at| at <= now) {
            self.refresh_at = None;
            self.issue_refresh();
        }

        if self.time_sync_at.is_some_and(|at| at <= now) {
            let interval = self.time_sync.sync_interval_ms();
            self.time_sync_at = Some(now + Duration::from_millis(interval));
            if self.transport.is_some() {
                self.dispatch(SendJob {
                    method: METHOD_GET_TIME.to_string(),
                    params: json!({}),
                    timeout_ms: None,
                    context: RequestContext::TimeProbe,
                });
            } else {
                self.time_sync.on_failure("transport down");
            }
        }

        while self.parked.front().is_some_and(|p| p.retry_at <= now) {
            let parked = self.parked.pop_front().expect("front checked");
            self.limiter.dequeue();
            self.dispatch(parked.job);
        }

        let now_ms = self.now_ms();
        for (id, pending) in self.correlator.collect_expired(now_ms) {
            tracing::warn!(
                target: "deribit_client",
                id,
                method = %pending.method,
                "rpc.timeout",
            );
            match pending.context {
                RequestContext::Refresh => {
                    let error = DeribitWsError::Timeout {
                        method: pending.method,
                    };
                    self.on_refresh_failure(&error);
                }
                context => context.fail(DeribitWsError::Timeout {
                    method: pending.method,
                }),
            }
        }
    }

    fn arm_refresh_timer(&mut self) {
        self.refresh_at = self.session.refresh_deadline_ms().map(|deadline_wall| {
            let remaining = deadline_wall.saturating_sub(wall_now_ms());
            Instant::now() + Duration::from_millis(remaining)
        });
    }

    fn issue_refresh(&mut self) {
        if self.state != DeribitConnectionState::Authenticated {
            return;
        }
        let Some(params) = self.session.refresh_params() else {
            return;
        };
        self.dispatch(SendJob {
            method: METHOD_AUTH.to_string(),
            params,
            timeout_ms: None,
            context: RequestContext::Refresh,
        });
    }

    fn on_refresh_failure(&mut self, error: &DeribitWsError) {
        if self.session.on_refresh_failure() {
            tracing::warn!(
                target: "deribit_client",
                error = %error,
                retry_in_secs = REFRESH_RETRY_DELAY_SECS,
                "auth.failure",
            );
            self.refresh_at =
                Some(Instant::now() + Duration::from_secs(REFRESH_RETRY_DELAY_SECS));
        } else {
            tracing::error!(
                target: "deribit_client",
                error = %error,
                "connection.auth_error_reconnect",
            );
            self.force_reconnect_with_auth();
        }
    }

    fn force_reconnect_with_auth(&mut self) {
        if let Some(transport) = &self.transport {
            transport.abort();
        }
        self.handle_close(CloseReason::Error("authentication lost".to_string()));
    }

    // -- Close / reconnect -------------------------------------------------

    fn handle_close(&mut self, reason: CloseReason) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        transport.abort();
        self.events_rx = None;

        for (_, pending) in self.correlator.drain_all() {
            pending.context.fail(DeribitWsError::ConnectionClosed);
        }
        for parked in self.parked.drain(..) {
            self.limiter.dequeue();
            parked.job.context.fail(DeribitWsError::ConnectionClosed);
        }
        self.refresh_at = None;
        if self.time_sync_at.take().is_some() {
            tracing::debug!(target: "deribit_client", "time_sync.stop");
        }

        let was_authenticated = self.state == DeribitConnectionState::Authenticated;
        tracing::info!(
            target: "deribit_client",
            reason = ?reason,
            was_authenticated,
            "connection.closed",
        );

        match reason {
            CloseReason::Normal | CloseReason::ShuttingDown => {
                self.set_state(DeribitConnectionState::Closed);
            }
            CloseReason::Error(_) => {
                if was_authenticated {
                    self.reconnect_authenticate = true;
                    self.registry.set_resubscribe_after_auth();
                    tracing::info!(
                        target: "deribit_client",
                        "connection.reconnect_with_auth",
                    );
                }
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_attempts < self.config.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            let delay = reconnect_delay(self.reconnect_attempts);
            self.set_state(DeribitConnectionState::Reconnecting);
            tracing::info!(
                target: "deribit_client",
                attempt = self.reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect",
            );
            self.reconnect_at = Some(Instant::now() + delay);
        } else {
            tracing::error!(
                target: "deribit_client",
                attempts = self.reconnect_attempts,
                "Reconnect attempts exhausted",
            );
            self.set_state(DeribitConnectionState::Closed);
        }
    }

    // -- Resubscription ----------------------------------------------------

    fn maybe_start_resubscribe(&mut self) {
        if self.resubscribing
            || !self.registry.resubscribe_after_auth()
            || self.registry.subscription_count() == 0
        {
            return;
        }
        self.resubscribing = true;
        tokio::spawn(run_resubscribe(self.cmd_tx.clone()));
    }

    fn handle_resubscribe_complete(&mut self, failed: Vec<Ustr>) {
        self.resubscribing = false;
        match self.registry.complete_resubscription(failed) {
            ResubscribeOutcome::Done => {}
            ResubscribeOutcome::Retry { .. } => {
                // Deferred to the next event tick via the spawned task.
                self.resubscribing = true;
                tokio::spawn(run_resubscribe(self.cmd_tx.clone()));
            }
            ResubscribeOutcome::Exhausted { failed } => {
                let _ = self
                    .msg_tx
                    .send(DeribitWsMessage::ResubscriptionFailed { channels: failed });
            }
        }
    }
}

// -------------------------------------------------------------------------
// Control tasks
// -------------------------------------------------------------------------

async fn bootstrap_call(
    cmd_tx: &mpsc::UnboundedSender<Command>,
    method: &str,
    params: Value,
) -> Result<Value, DeribitWsError> {
    let (waiter, rx) = oneshot::channel();
    cmd_tx
        .send(Command::Call {
            method: method.to_string(),
            params,
            timeout_ms: None,
            waiter,
        })
        .map_err(|_| DeribitWsError::ConnectionClosed)?;
    rx.await.map_err(|_| DeribitWsError::ConnectionClosed)?
}

fn bootstrap_step<T>(step: u8, outcome: Result<T, DeribitWsError>) -> Result<T, DeribitWsError> {
    outcome.map_err(|e| DeribitWsError::Bootstrap {
        step,
        reason: e.to_string(),
    })
}

/// Runs the post-connect bootstrap sequence.
///
/// Steps: hello, get_time, status, set_heartbeat, auth (optional),
/// cancel-on-disconnect (optional). A failure at step N aborts the sequence
/// and leaves the connection up but unauthenticated.
async fn run_bootstrap(
    cmd_tx: &mpsc::UnboundedSender<Command>,
    config: &DeribitClientConfig,
    authenticate: bool,
) -> Result<(), DeribitWsError> {
    let hello = bootstrap_step(
        1,
        bootstrap_call(
            cmd_tx,
            METHOD_HELLO,
            json!({
                "client_name": config.client_name,
                "client_version": config.client_version,
            }),
        )
        .await,
    )?;
    tracing::debug!(target: "deribit_client", result = %hello, "Bootstrap hello complete");

    bootstrap_step(2, bootstrap_call(cmd_tx, METHOD_GET_TIME, json!({})).await)?;

    let status = bootstrap_step(3, bootstrap_call(cmd_tx, METHOD_STATUS, json!({})).await)?;
    if let Some(locked) = status.get("locked") {
        tracing::debug!(target: "deribit_client", locked = %locked, "Platform status");
    }

    let interval_secs = config.effective_heartbeat_secs();
    bootstrap_step(4, {
        let (waiter, rx) = oneshot::channel();
        cmd_tx
            .send(Command::SetHeartbeat {
                interval_secs,
                waiter,
            })
            .map_err(|_| DeribitWsError::ConnectionClosed)?;
        rx.await.map_err(|_| DeribitWsError::ConnectionClosed)?
    })?;

    if authenticate {
        bootstrap_step(5, {
            let (waiter, rx) = oneshot::channel();
            cmd_tx
                .send(Command::Authenticate { waiter })
                .map_err(|_| DeribitWsError::ConnectionClosed)?;
            rx.await
                .map_err(|_| DeribitWsError::ConnectionClosed)?
                .map(|_| ())
        })?;

        if config.cod_enabled {
            bootstrap_step(6, {
                let (waiter, rx) = oneshot::channel();
                cmd_tx
                    .send(Command::EnableCod {
                        scope: config.cod_scope,
                        waiter,
                    })
                    .map_err(|_| DeribitWsError::ConnectionClosed)?;
                rx.await.map_err(|_| DeribitWsError::ConnectionClosed)?
            })?;
        }
    }

    Ok(())
}

/// Replays the tracked subscription set serially, collecting failures.
async fn run_resubscribe(cmd_tx: mpsc::UnboundedSender<Command>) {
    let (reply, rx) = oneshot::channel();
    if cmd_tx.send(Command::BeginResubscribe { reply }).is_err() {
        return;
    }
    let Ok(batch) = rx.await else { return };
    if batch.is_empty() {
        // Leaves resubscribe_after_auth set for late registrations.
        let _ = cmd_tx.send(Command::CompleteResubscribe { failed: Vec::new() });
        return;
    }

    let mut failed = Vec::new();
    for (channel, params) in batch {
        let (waiter, rx) = oneshot::channel();
        if cmd_tx
            .send(Command::Subscribe {
                channel,
                params,
                waiter,
            })
            .is_err()
        {
            failed.push(channel);
            continue;
        }
        match rx.await {
            Ok(Ok(())) => {
                tracing::debug!(
                    target: "deribit_client",
                    channel = %channel,
                    "resubscription.channel.success",
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "deribit_client",
                    channel = %channel,
                    error = %e,
                    "resubscription.channel.failure",
                );
                failed.push(channel);
            }
            Err(_) => failed.push(channel),
        }
    }

    let _ = cmd_tx.send(Command::CompleteResubscribe { failed });
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
