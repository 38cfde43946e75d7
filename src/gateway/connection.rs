/// Per-gateway connection actor
///
/// Each gateway gets one tokio task that exclusively owns the socket, the
/// command correlator and the topic router. Callers talk to it through the
/// cloneable `GatewayConnection` handle: requests go in over an mpsc
/// channel, state comes out over a watch channel carrying
/// `ConnectionSnapshot`s.
///
/// Lifecycle:
/// ```text
/// Disconnected -> Connecting -> Connected -> Authenticating -> Authenticated
///                     ^                                             |
///                     +---------- Reconnecting <--- socket lost ----+
/// ```
/// Connect and auth failures outside a reconnection cycle land in Error.
/// `disconnect()` goes to Disconnected from anywhere.
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::codec::{self, WireMessage};
use super::correlator::{CommandCorrelator, Reply, Responder, Settled};
use super::router::{
    sink_channel, JsonValidator, PassThrough, PayloadValidator, Subscription, SubscriptionId,
    TopicRouter, TopicSink,
};
use super::state::{ConnectionSnapshot, ConnectionState, ConnectionStats, ReconnectPolicy};
use super::transport::{next_transport_event, Connector, SocketChannels, TransportEvent};
use super::{GatewayId, GatewayIdentity, AUTH_COMMAND, PING_COMMAND};
use crate::config::Config;
use crate::errors::GatewayError;
use crate::logger::{self, LogTag};

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    /// Used by `send_command` when no explicit timeout is given
    pub command_timeout: Duration,
    pub ping_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connection.connect_timeout_ms),
            auth_timeout: Duration::from_millis(config.connection.auth_timeout_ms),
            command_timeout: Duration::from_millis(config.commands.default_timeout_ms),
            ping_timeout: Duration::from_millis(config.commands.ping_timeout_ms),
            reconnect: ReconnectPolicy::from_config(&config.reconnect),
        }
    }
}

/// Result of `GatewayConnection::ping`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PingResult {
    /// Measured round trip in milliseconds
    #[serde(rename = "latency")]
    pub latency_ms: u64,
}

// ============================================================================
// ACTOR MESSAGES
// ============================================================================

type Waiter = oneshot::Sender<Result<(), GatewayError>>;

enum Request {
    Connect {
        reply: Waiter,
    },
    Authenticate {
        reply: Waiter,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Command {
        name: String,
        payload: Value,
        timeout: Duration,
        reply: Reply,
    },
    Subscribe {
        topic: String,
        sink: Box<dyn TopicSink>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Outcome of a socket open attempt, tagged so stale ones can be ignored
struct AttemptOutcome {
    generation: u64,
    result: Result<SocketChannels, GatewayError>,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Cloneable handle to one gateway's connection actor
#[derive(Clone)]
pub struct GatewayConnection {
    identity: Arc<GatewayIdentity>,
    options: Arc<ConnectionOptions>,
    requests: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
}

impl std::fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("gateway_id", &self.identity.id)
            .field("url", &self.identity.url)
            .field("state", &self.state())
            .finish()
    }
}

impl GatewayConnection {
    /// Start the actor in Disconnected state; must run inside a tokio runtime
    pub fn spawn(
        identity: GatewayIdentity,
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::new(identity.id.clone()));

        let identity = Arc::new(identity);
        let options = Arc::new(options);

        let actor = ConnectionActor {
            identity: identity.clone(),
            connector,
            options: options.clone(),
            snapshot_tx,
            state: ConnectionState::Disconnected,
            error: None,
            stats: ConnectionStats::default(),
            socket: None,
            correlator: CommandCorrelator::new(),
            router: TopicRouter::new(),
            waiters: Vec::new(),
            attempt: None,
            generation: 0,
            attempt_tx,
            reconnect_at: None,
            reconnect_attempt: 0,
            in_cycle: false,
        };
        tokio::spawn(actor.run(request_rx, attempt_rx));

        Self {
            identity,
            options,
            requests: request_tx,
            snapshot: snapshot_rx,
        }
    }

    pub fn id(&self) -> &GatewayId {
        &self.identity.id
    }

    pub fn identity(&self) -> &GatewayIdentity {
        &self.identity
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    /// Receiver that sees every published snapshot
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Whether the actor task is still running
    pub fn is_alive(&self) -> bool {
        !self.requests.is_closed()
    }

    fn request(&self, request: Request) -> Result<(), GatewayError> {
        self.requests
            .send(request)
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    /// Open the socket and authenticate; resolves once Authenticated or failed
    ///
    /// While an attempt is already under way this joins it.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let (reply, outcome) = oneshot::channel();
        self.request(Request::Connect { reply })?;
        outcome.await.map_err(|_| GatewayError::ConnectionClosed)?
    }

    /// Retry authentication on an open socket (after a rejection or timeout)
    pub async fn authenticate(&self) -> Result<(), GatewayError> {
        let (reply, outcome) = oneshot::channel();
        self.request(Request::Authenticate { reply })?;
        outcome.await.map_err(|_| GatewayError::ConnectionClosed)?
    }

    /// Close the socket, cancel reconnection and reject pending commands
    ///
    /// Subscriptions stay registered and resume after the next `connect()`.
    pub async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self.request(Request::Disconnect { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Disconnect and stop the actor; subscription streams end
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.request(Request::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }

    pub async fn send_command(&self, name: &str, payload: Value) -> Result<Value, GatewayError> {
        self.send_command_with_timeout(name, payload, self.options.command_timeout)
            .await
    }

    pub async fn send_command_with_timeout(
        &self,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let (reply, outcome) = oneshot::channel();
        self.request(Request::Command {
            name: name.to_string(),
            payload,
            timeout,
            reply,
        })?;
        outcome.await.map_err(|_| GatewayError::ConnectionClosed)?
    }

    /// Round-trip probe
    pub async fn ping(&self) -> Result<PingResult, GatewayError> {
        let started = Instant::now();
        self.send_command_with_timeout(PING_COMMAND, json!({}), self.options.ping_timeout)
            .await?;
        Ok(PingResult {
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Untyped subscription yielding raw JSON payloads
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription<Value>, GatewayError> {
        self.subscribe_with(topic, PassThrough).await
    }

    /// Subscription whose payloads are deserialized into `T`
    pub async fn subscribe_json<T>(&self, topic: &str) -> Result<Subscription<T>, GatewayError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.subscribe_with(topic, JsonValidator::<T>::new()).await
    }

    pub async fn subscribe_with<T, V>(
        &self,
        topic: &str,
        validator: V,
    ) -> Result<Subscription<T>, GatewayError>
    where
        T: Send + 'static,
        V: PayloadValidator<T> + 'static,
    {
        let (sink, rx) = sink_channel::<T>(Box::new(validator));
        let (reply, registered) = oneshot::channel();
        self.request(Request::Subscribe {
            topic: topic.to_string(),
            sink,
            reply,
        })?;
        let id = registered.await.map_err(|_| GatewayError::ConnectionClosed)?;

        let requests = self.requests.clone();
        Ok(Subscription::new(
            id,
            topic.to_string(),
            rx,
            Box::new(move |id: SubscriptionId| {
                let _ = requests.send(Request::Unsubscribe { id });
            }),
        ))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.request(Request::Unsubscribe { id });
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<ConnectionSnapshot, GatewayError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| GatewayError::ConnectionClosed)?;
        Ok(snapshot.clone())
    }

    pub async fn wait_until_authenticated(&self) -> Result<(), GatewayError> {
        self.wait_for_state(ConnectionState::Authenticated).await.map(|_| ())
    }
}

// ============================================================================
// ACTOR
// ============================================================================

struct ConnectionActor {
    identity: Arc<GatewayIdentity>,
    connector: Arc<dyn Connector>,
    options: Arc<ConnectionOptions>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,

    state: ConnectionState,
    error: Option<String>,
    stats: ConnectionStats,
    socket: Option<SocketChannels>,
    correlator: CommandCorrelator,
    router: TopicRouter,

    /// `connect()` / `authenticate()` callers waiting for the outcome
    waiters: Vec<Waiter>,

    attempt: Option<JoinHandle<()>>,
    generation: u64,
    attempt_tx: mpsc::UnboundedSender<AttemptOutcome>,

    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    /// Set when an authenticated socket was lost; cleared on success or giving up
    in_cycle: bool,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut attempts: mpsc::UnboundedReceiver<AttemptOutcome>,
    ) {
        logger::debug(
            LogTag::Connection,
            &format!("Connection actor for gateway {} started", self.identity.id),
        );

        loop {
            let reconnect_at = self.reconnect_at;
            let command_deadline = self.correlator.next_deadline();

            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        // every handle is gone
                        self.shutdown();
                        break;
                    }
                },
                Some(outcome) = attempts.recv() => self.handle_attempt(outcome),
                event = next_transport_event(&mut self.socket) => self.handle_transport(event),
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt();
                }
                _ = sleep_until_opt(command_deadline) => self.expire_commands(),
            }

            self.publish();
        }

        logger::debug(
            LogTag::Connection,
            &format!("Connection actor for gateway {} stopped", self.identity.id),
        );
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { reply } => self.request_connect(reply),
            Request::Authenticate { reply } => self.request_authenticate(reply),
            Request::Disconnect { reply } => {
                self.disconnect();
                self.publish();
                let _ = reply.send(());
            }
            Request::Command {
                name,
                payload,
                timeout,
                reply,
            } => self.issue_command(name, payload, timeout, reply),
            Request::Subscribe { topic, sink, reply } => {
                let id = self.router.add(&topic, sink);
                logger::debug(
                    LogTag::Topics,
                    &format!("Gateway {}: subscription #{} on '{}'", self.identity.id, id, topic),
                );
                let _ = reply.send(id);
            }
            Request::Unsubscribe { id } => {
                if self.router.remove(id) {
                    logger::debug(
                        LogTag::Topics,
                        &format!("Gateway {}: subscription #{} removed", self.identity.id, id),
                    );
                }
            }
            Request::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn request_connect(&mut self, reply: Waiter) {
        match self.state {
            ConnectionState::Authenticated => {
                let _ = reply.send(Ok(()));
            }
            state if state.is_active() => {
                logger::debug(
                    LogTag::Connection,
                    &format!(
                        "Gateway {}: connect() joined attempt in progress ({})",
                        self.identity.id, state
                    ),
                );
                self.waiters.push(reply);
            }
            _ => {
                self.waiters.push(reply);
                self.in_cycle = false;
                self.reconnect_attempt = 0;
                self.teardown_socket();
                self.start_attempt();
            }
        }
    }

    fn request_authenticate(&mut self, reply: Waiter) {
        match self.state {
            ConnectionState::Authenticated => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Authenticating => self.waiters.push(reply),
            ConnectionState::Connected | ConnectionState::Error if self.socket.is_some() => {
                self.waiters.push(reply);
                self.begin_authentication();
            }
            state => {
                let _ = reply.send(Err(GatewayError::NotConnected { state }));
            }
        }
    }

    fn issue_command(&mut self, name: String, payload: Value, timeout: Duration, reply: Reply) {
        if self.state != ConnectionState::Authenticated {
            let _ = reply.send(Err(GatewayError::NotAuthenticated { state: self.state }));
            return;
        }

        let id = self
            .correlator
            .register(&name, timeout, Responder::Caller(reply));
        logger::debug(
            LogTag::Commands,
            &format!(
                "Gateway {}: -> {} #{} (timeout {}ms)",
                self.identity.id,
                name,
                id,
                timeout.as_millis()
            ),
        );

        if !self.send_frame(&WireMessage::command(id, name, payload)) {
            self.correlator.cancel(id, GatewayError::ConnectionClosed);
        }
    }

    // ------------------------------------------------------------------------
    // Connect / authenticate
    // ------------------------------------------------------------------------

    fn start_attempt(&mut self) {
        if let Some(previous) = self.attempt.take() {
            previous.abort();
        }
        self.generation += 1;
        self.transition(ConnectionState::Connecting);

        let generation = self.generation;
        let connector = self.connector.clone();
        let identity = self.identity.clone();
        let timeout = self.options.connect_timeout;
        let outcomes = self.attempt_tx.clone();

        logger::info(
            LogTag::Connection,
            &format!(
                "Gateway {}: connecting to {} via {}{}",
                identity.id,
                identity.url,
                connector.name(),
                if self.in_cycle {
                    format!(" (reconnect attempt {})", self.reconnect_attempt)
                } else {
                    String::new()
                }
            ),
        );

        self.attempt = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.open(&identity)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::connect(
                    &identity.url,
                    format!("timed out after {}ms", timeout.as_millis()),
                )),
            };
            let _ = outcomes.send(AttemptOutcome { generation, result });
        }));
    }

    fn handle_attempt(&mut self, outcome: AttemptOutcome) {
        if outcome.generation != self.generation || self.state != ConnectionState::Connecting {
            logger::debug(
                LogTag::Connection,
                &format!("Gateway {}: stale connect attempt ignored", self.identity.id),
            );
            return;
        }
        self.attempt = None;

        match outcome.result {
            Ok(channels) => {
                self.socket = Some(channels);
                self.stats.connected_at = Some(Utc::now());
                self.transition(ConnectionState::Connected);
                self.begin_authentication();
            }
            Err(e) => {
                logger::warning(
                    LogTag::Connection,
                    &format!("Gateway {}: connect failed: {}", self.identity.id, e),
                );
                self.fail_attempt(e);
            }
        }
    }

    fn begin_authentication(&mut self) {
        let payload = json!({
            "username": self.identity.credentials.username,
            "password": self.identity.credentials.password,
        });
        let id = self.correlator.register(
            AUTH_COMMAND,
            self.options.auth_timeout,
            Responder::Authentication,
        );
        self.transition(ConnectionState::Authenticating);

        // A failed send means the socket is gone; its close event follows
        self.send_frame(&WireMessage::command(id, AUTH_COMMAND, payload));
    }

    fn on_auth_outcome(&mut self, outcome: Result<Value, GatewayError>) {
        if self.state != ConnectionState::Authenticating {
            return;
        }

        match outcome {
            Ok(result) => {
                self.stats.authenticated_at = Some(Utc::now());
                self.error = None;
                self.in_cycle = false;
                self.reconnect_attempt = 0;
                self.transition(ConnectionState::Authenticated);

                let session = result
                    .get("session")
                    .and_then(Value::as_str)
                    .map(|s| format!(" (session {})", s))
                    .unwrap_or_default();
                logger::info(
                    LogTag::Connection,
                    &format!("Gateway {}: authenticated{}", self.identity.id, session),
                );
                self.resolve_waiters(Ok(()));
            }
            Err(e) => {
                let error = match e {
                    GatewayError::Command { message, .. } => GatewayError::Auth { reason: message },
                    other => other,
                };
                logger::error(
                    LogTag::Connection,
                    &format!("Gateway {}: authentication failed: {}", self.identity.id, error),
                );

                if self.in_cycle && error.is_retryable() {
                    self.fail_attempt(error);
                } else {
                    // socket stays open so authenticate() can retry
                    self.record_failure(&error.to_string());
                    self.in_cycle = false;
                    self.transition(ConnectionState::Error);
                    self.resolve_waiters(Err(error));
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------------

    fn fail_attempt(&mut self, error: GatewayError) {
        self.teardown_socket();
        self.record_failure(&error.to_string());
        self.retry_or_fail(error);
    }

    fn retry_or_fail(&mut self, error: GatewayError) {
        if self.in_cycle && error.is_retryable() {
            self.schedule_reconnect();
        } else {
            self.in_cycle = false;
            self.transition(ConnectionState::Error);
            self.resolve_waiters(Err(error));
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempt += 1;
        match self.options.reconnect.delay_for(self.reconnect_attempt) {
            Some(delay) => {
                self.reconnect_at = Some(Instant::now() + delay);
                self.transition(ConnectionState::Reconnecting);
                logger::info(
                    LogTag::Connection,
                    &format!(
                        "Gateway {}: reconnect attempt {}/{} in {}ms",
                        self.identity.id,
                        self.reconnect_attempt,
                        self.options.reconnect.max_attempts,
                        delay.as_millis()
                    ),
                );
            }
            None => {
                let error = GatewayError::connect(
                    &self.identity.url,
                    format!("gave up after {} reconnect attempts", self.reconnect_attempt - 1),
                );
                logger::error(
                    LogTag::Connection,
                    &format!("Gateway {}: {}", self.identity.id, error),
                );
                self.in_cycle = false;
                self.reconnect_attempt = 0;
                self.record_failure(&error.to_string());
                self.transition(ConnectionState::Error);
                self.resolve_waiters(Err(error));
            }
        }
    }

    fn on_socket_lost(&mut self, reason: String) {
        let previous = self.state;
        self.teardown_socket();
        self.record_failure(&reason);
        logger::warning(
            LogTag::Connection,
            &format!("Gateway {}: socket lost in {}: {}", self.identity.id, previous, reason),
        );

        match previous {
            ConnectionState::Authenticated => {
                if self.options.reconnect.enabled {
                    self.in_cycle = true;
                    self.reconnect_attempt = 0;
                    self.schedule_reconnect();
                } else {
                    self.transition(ConnectionState::Error);
                }
            }
            ConnectionState::Connected | ConnectionState::Authenticating => {
                self.retry_or_fail(GatewayError::ConnectionClosed)
            }
            // Error with the socket held open after a rejected login
            _ => {}
        }
    }

    fn record_failure(&mut self, message: &str) {
        self.stats.error_count += 1;
        self.error = Some(message.to_string());
    }

    /// Drop the socket and reject every command waiting on it
    fn teardown_socket(&mut self) {
        self.socket = None;
        let rejected = self.correlator.reject_all(GatewayError::ConnectionClosed);
        if !rejected.is_empty() {
            logger::debug(
                LogTag::Commands,
                &format!(
                    "Gateway {}: rejected {} pending command(s), connection closed",
                    self.identity.id,
                    rejected.len()
                ),
            );
        }
    }

    fn disconnect(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.generation += 1;
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.in_cycle = false;
        self.teardown_socket();

        if self.state != ConnectionState::Disconnected {
            logger::info(
                LogTag::Connection,
                &format!("Gateway {}: disconnected", self.identity.id),
            );
        }
        self.transition(ConnectionState::Disconnected);
        self.resolve_waiters(Err(GatewayError::ConnectionClosed));
    }

    fn shutdown(&mut self) {
        self.disconnect();
        self.router.clear();
        self.publish();
    }

    // ------------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------------

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => {
                self.note_inbound();
                logger::verbose(
                    LogTag::Connection,
                    &format!("Gateway {}: <- {}", self.identity.id, text),
                );
                for decoded in codec::decode_frame(&text) {
                    self.handle_decoded(decoded);
                }
            }
            TransportEvent::Binary(bytes) => {
                self.note_inbound();
                for decoded in codec::decode_binary(&bytes) {
                    self.handle_decoded(decoded);
                }
            }
            TransportEvent::Closed(reason) => {
                let reason = match reason {
                    Some(reason) => format!("socket closed by gateway: {}", reason),
                    None => "socket closed by gateway".to_string(),
                };
                self.on_socket_lost(reason);
            }
            TransportEvent::Error(e) => self.on_socket_lost(format!("socket error: {}", e)),
        }
    }

    fn note_inbound(&mut self) {
        self.stats.last_message_at = Some(Utc::now());
        self.stats.messages_received += 1;
    }

    fn handle_decoded(&mut self, decoded: Result<WireMessage, crate::errors::DecodeError>) {
        match decoded {
            Ok(message) => self.handle_message(message),
            Err(e) => logger::warning(
                LogTag::Connection,
                &format!("Gateway {}: dropped undecodable frame: {}", self.identity.id, e),
            ),
        }
    }

    fn handle_message(&mut self, message: WireMessage) {
        match message {
            WireMessage::Response {
                id,
                ok,
                result,
                error,
            } => match self.correlator.complete(id, ok, result, error) {
                Some(Settled::Caller { id, name }) => logger::debug(
                    LogTag::Commands,
                    &format!(
                        "Gateway {}: <- {} #{} ({})",
                        self.identity.id,
                        name,
                        id,
                        if ok { "ok" } else { "failed" }
                    ),
                ),
                Some(Settled::Authentication(outcome)) => self.on_auth_outcome(outcome),
                None => logger::debug(
                    LogTag::Commands,
                    &format!(
                        "Gateway {}: response for unknown command #{} discarded",
                        self.identity.id, id
                    ),
                ),
            },
            WireMessage::Event { topic, payload } => {
                let report = self.router.publish(&topic, &payload);
                logger::debug(
                    LogTag::Topics,
                    &format!(
                        "Gateway {}: '{}' -> {} delivered, {} rejected, {} pruned",
                        self.identity.id, topic, report.delivered, report.rejected, report.pruned
                    ),
                );
            }
            WireMessage::Command { id, name, .. } => logger::debug(
                LogTag::Commands,
                &format!(
                    "Gateway {}: ignoring gateway-initiated command '{}' #{}",
                    self.identity.id, name, id
                ),
            ),
        }
    }

    fn expire_commands(&mut self) {
        for settled in self.correlator.expire_due(Instant::now()) {
            match settled {
                Settled::Caller { id, name } => logger::warning(
                    LogTag::Commands,
                    &format!("Gateway {}: {} #{} timed out", self.identity.id, name, id),
                ),
                Settled::Authentication(outcome) => self.on_auth_outcome(outcome),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outbound / state
    // ------------------------------------------------------------------------

    fn send_frame(&mut self, message: &WireMessage) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };

        let frame = match codec::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                logger::error(
                    LogTag::Connection,
                    &format!("Gateway {}: failed to encode {}: {}", self.identity.id, message.kind(), e),
                );
                return false;
            }
        };

        if socket.outbound.send(frame).is_err() {
            return false;
        }
        self.stats.messages_sent += 1;
        true
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            logger::warning(
                LogTag::Connection,
                &format!(
                    "Gateway {}: unexpected transition {} -> {}",
                    self.identity.id, self.state, next
                ),
            );
        }
        logger::debug(
            LogTag::Connection,
            &format!("Gateway {}: {} -> {}", self.identity.id, self.state, next),
        );
        self.state = next;
    }

    fn resolve_waiters(&mut self, result: Result<(), GatewayError>) {
        if self.waiters.is_empty() {
            return;
        }
        // waiters read the snapshot as soon as they wake
        self.publish();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn publish(&self) {
        let next = ConnectionSnapshot {
            gateway_id: self.identity.id.clone(),
            state: self.state,
            error: self.error.clone(),
            stats: self.stats.clone(),
            pending_commands: self.correlator.len(),
            subscriptions: self.router.len(),
            reconnect_attempt: self.reconnect_attempt,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::transport::{GatewaySession, MemoryConnector};
    use crate::gateway::Credentials;

    fn identity() -> GatewayIdentity {
        GatewayIdentity::new("gw-1", "memory://gw-1", Credentials::new("admin", "secret"))
    }

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_secs(1),
            auth_timeout: Duration::from_millis(300),
            command_timeout: Duration::from_millis(300),
            ping_timeout: Duration::from_millis(300),
            reconnect: ReconnectPolicy {
                enabled: true,
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                max_attempts: 3,
            },
        }
    }

    fn spawn_with(options: ConnectionOptions) -> (GatewayConnection, MemoryConnector, mpsc::UnboundedReceiver<GatewaySession>) {
        let (connector, acceptor) = MemoryConnector::new();
        let conn = GatewayConnection::spawn(identity(), Arc::new(connector.clone()), options);
        (conn, connector, acceptor)
    }

    /// Accept the next session and answer its authentication command
    async fn accept(acceptor: &mut mpsc::UnboundedReceiver<GatewaySession>, accept_login: bool) -> GatewaySession {
        let mut session = acceptor.recv().await.unwrap();
        match session.recv_message().await {
            Some(WireMessage::Command { id, name, payload }) => {
                assert_eq!(name, AUTH_COMMAND);
                assert_eq!(payload, json!({"username": "admin", "password": "secret"}));
                let reply = if accept_login {
                    WireMessage::response_ok(id, json!({"session": "s-1"}))
                } else {
                    WireMessage::response_err(id, Some("E_AUTH"), "invalid credentials")
                };
                assert!(session.send_message(&reply));
            }
            other => panic!("expected authenticate, got {:?}", other),
        }
        session
    }

    async fn connected() -> (GatewayConnection, MemoryConnector, mpsc::UnboundedReceiver<GatewaySession>, GatewaySession) {
        let (conn, connector, mut acceptor) = spawn_with(fast_options());
        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let session = accept(&mut acceptor, true).await;
        pending.await.unwrap().unwrap();
        (conn, connector, acceptor, session)
    }

    async fn next_command(session: &mut GatewaySession) -> (u64, String, Value) {
        match session.recv_message().await {
            Some(WireMessage::Command { id, name, payload }) => (id, name, payload),
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_reaches_authenticated_with_stats() {
        let (conn, _connector, _acceptor, _session) = connected().await;

        let snapshot = conn.snapshot();
        assert_eq!(snapshot.gateway_id.as_str(), "gw-1");
        assert_eq!(snapshot.state, ConnectionState::Authenticated);
        assert!(snapshot.stats.connected_at.is_some());
        assert!(snapshot.stats.authenticated_at.is_some());
        assert!(snapshot.stats.authenticated_at >= snapshot.stats.connected_at);
        assert_eq!(snapshot.stats.messages_sent, 1);
        assert_eq!(snapshot.stats.messages_received, 1);
        assert!(snapshot.stats.last_message_at.is_some());
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_socket() {
        let (conn, connector, mut acceptor) = spawn_with(fast_options());

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });

        let _session = accept(&mut acceptor, true).await;
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // already authenticated: resolves at once without a new socket
        conn.connect().await.unwrap();
        assert_eq!(connector.opened_count(), 1);
        assert!(acceptor.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_command_before_authentication_sends_nothing() {
        let (conn, connector, _acceptor) = spawn_with(fast_options());

        let err = conn.send_command("ping", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::NotAuthenticated {
                state: ConnectionState::Disconnected
            }
        );
        assert_eq!(conn.snapshot().stats.messages_sent, 0);
        assert_eq!(connector.opened_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_and_unknown_ids() {
        let (conn, _connector, _acceptor, mut session) = connected().await;

        let temperature = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_command("take_dynamic_temperature", json!({"serial": 1001})).await }
        });
        let (temp_id, name, payload) = next_command(&mut session).await;
        assert_eq!(name, "take_dynamic_temperature");
        assert_eq!(payload, json!({"serial": 1001}));

        let battery = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_command("take_dynamic_battery", json!({"serial": 1001})).await }
        });
        let (battery_id, _, _) = next_command(&mut session).await;
        assert_ne!(temp_id, battery_id);

        session.send_message(&WireMessage::response_ok(9_999, json!({"stray": true})));
        session.send_message(&WireMessage::response_ok(battery_id, json!({"battery": 80})));
        session.send_message(&WireMessage::response_err(temp_id, None, "sensor asleep"));

        assert_eq!(battery.await.unwrap(), Ok(json!({"battery": 80})));
        assert_eq!(
            temperature.await.unwrap(),
            Err(GatewayError::Command {
                command: "take_dynamic_temperature".into(),
                code: None,
                message: "sensor asleep".into()
            })
        );
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.snapshot().pending_commands, 0);
    }

    #[tokio::test]
    async fn test_timeout_fires_once_and_late_response_is_dropped() {
        let (conn, _connector, _acceptor, mut session) = connected().await;

        let slow = tokio::spawn({
            let conn = conn.clone();
            async move {
                conn.send_command_with_timeout("discover_sensors", json!({}), Duration::from_millis(50))
                    .await
            }
        });
        let (id, _, _) = next_command(&mut session).await;

        assert_eq!(
            slow.await.unwrap(),
            Err(GatewayError::CommandTimeout {
                command: "discover_sensors".into(),
                timeout_ms: 50
            })
        );

        session.send_message(&WireMessage::response_ok(id, json!([])));
        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.ping().await }
        });
        let (ping_id, name, _) = next_command(&mut session).await;
        assert_eq!(name, PING_COMMAND);
        session.send_message(&WireMessage::response_ok(ping_id, json!({"pong": true})));
        assert!(ping.await.unwrap().is_ok());
        assert_eq!(conn.snapshot().pending_commands, 0);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_commands() {
        let (conn, _connector, _acceptor, mut session) = connected().await;

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_command("take_dynamic_reading", json!({"serial": 5})).await }
        });
        next_command(&mut session).await;

        conn.disconnect().await;
        assert_eq!(pending.await.unwrap(), Err(GatewayError::ConnectionClosed));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(session.recv_raw().await, None);
    }

    #[tokio::test]
    async fn test_rejected_login_then_retry() {
        let (conn, _connector, mut acceptor) = spawn_with(fast_options());
        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let mut session = accept(&mut acceptor, false).await;

        assert_eq!(
            pending.await.unwrap(),
            Err(GatewayError::Auth {
                reason: "invalid credentials".into()
            })
        );
        let snapshot = conn.wait_for_state(ConnectionState::Error).await.unwrap();
        assert!(snapshot.error.unwrap().contains("invalid credentials"));

        let retry = tokio::spawn({
            let conn = conn.clone();
            async move { conn.authenticate().await }
        });
        let (id, name, _) = next_command(&mut session).await;
        assert_eq!(name, AUTH_COMMAND);
        session.send_message(&WireMessage::response_ok(id, json!({})));
        retry.await.unwrap().unwrap();

        let snapshot = conn.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Authenticated);
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test]
    async fn test_authenticate_without_socket_fails() {
        let (conn, _connector, _acceptor) = spawn_with(fast_options());
        assert_eq!(
            conn.authenticate().await,
            Err(GatewayError::NotConnected {
                state: ConnectionState::Disconnected
            })
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_retried_outside_cycle() {
        let (conn, connector, _acceptor) = spawn_with(fast_options());
        connector.set_refusing(true);

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connect { .. }));
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert_eq!(snapshot.stats.error_count, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_unexpected_close_reconnects() {
        let (conn, connector, mut acceptor, session) = connected().await;
        let mut states = conn.watch();

        session.close(Some("firmware update"));
        let reconnecting = states
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .unwrap()
            .clone();
        assert_eq!(reconnecting.reconnect_attempt, 1);
        assert!(reconnecting.error.unwrap().contains("firmware update"));

        let _session = accept(&mut acceptor, true).await;
        let snapshot = conn
            .wait_for_state(ConnectionState::Authenticated)
            .await
            .unwrap();
        assert_eq!(snapshot.stats.error_count, 1);
        assert_eq!(snapshot.reconnect_attempt, 0);
        assert_eq!(snapshot.error, None);
        assert_eq!(connector.opened_count(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let (conn, connector, _acceptor, session) = connected().await;
        connector.set_refusing(true);
        session.close(None);

        let snapshot = tokio::time::timeout(
            Duration::from_secs(2),
            conn.wait_for_state(ConnectionState::Error),
        )
        .await
        .unwrap()
        .unwrap();
        // the lost socket plus three refused attempts plus giving up
        assert_eq!(snapshot.stats.error_count, 5);
        assert!(snapshot.error.unwrap().contains("gave up"));
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let mut options = fast_options();
        options.reconnect = ReconnectPolicy::disabled();
        let (conn, _connector, mut acceptor) = spawn_with(options);
        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let session = accept(&mut acceptor, true).await;
        pending.await.unwrap().unwrap();

        session.fail("network unreachable");
        let snapshot = conn.wait_for_state(ConnectionState::Error).await.unwrap();
        assert!(snapshot.error.unwrap().contains("network unreachable"));
    }

    #[tokio::test]
    async fn test_auth_timeout_moves_to_error() {
        let (conn, _connector, mut acceptor) = spawn_with(fast_options());
        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let mut session = acceptor.recv().await.unwrap();
        let (_, name, _) = next_command(&mut session).await;
        assert_eq!(name, AUTH_COMMAND);

        assert_eq!(
            pending.await.unwrap(),
            Err(GatewayError::CommandTimeout {
                command: AUTH_COMMAND.into(),
                timeout_ms: 300
            })
        );
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_events_reach_subscribers_and_survive_disconnect() {
        let (conn, _connector, mut acceptor, session) = connected().await;
        let mut sub = conn.subscribe("sensor/1001/temperature").await.unwrap();
        assert_eq!(conn.snapshot().subscriptions, 1);

        session.send_message(&WireMessage::event("sensor/1001/temperature", json!({"temperature": 22.0})));
        session.send_message(&WireMessage::event("sensor/1002/temperature", json!({"temperature": 30.0})));
        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event.payload, json!({"temperature": 22.0}));

        conn.disconnect().await;
        assert_eq!(conn.snapshot().subscriptions, 1);

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let session = accept(&mut acceptor, true).await;
        pending.await.unwrap().unwrap();
        session.send_message(&WireMessage::event("sensor/1001/temperature", json!({"temperature": 23.5})));
        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event.payload, json!({"temperature": 23.5}));

        conn.shutdown().await;
        assert!(sub.recv().await.is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (conn, _connector, _acceptor, mut session) = connected().await;
        assert!(session.send_raw("{not json"));
        assert!(session.send_raw(r#"{"kind":"mystery"}"#));

        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.ping().await }
        });
        let (id, _, _) = next_command(&mut session).await;
        session.send_message(&WireMessage::response_ok(id, json!({"pong": true})));
        let result = ping.await.unwrap().unwrap();
        assert!(result.latency_ms < 300);
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(
            serde_json::to_value(result).unwrap(),
            json!({"latency": result.latency_ms})
        );
    }
}
