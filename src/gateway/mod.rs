/// Gateway connection subsystem
///
/// Each physical gateway gets one persistent duplex connection that
/// multiplexes command/response exchanges and topic pushes over a single
/// socket.
///
/// ## Key Components
/// - `codec`: JSON envelope (command / response / event)
/// - `transport`: socket seam (`Connector`), WebSocket and in-memory implementations
/// - `state`: connection state machine, stats, reconnection policy
/// - `correlator`: in-flight commands keyed by correlation id, with deadlines
/// - `router`: per-connection topic fan-out with per-subscriber validation
/// - `connection`: the per-gateway actor and its cloneable handle
/// - `manager`: gateway id → connection registry
/// - `simulator`: in-process gateway speaking the wire protocol
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod manager;
pub mod router;
pub mod simulator;
pub mod state;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use codec::{CorrelationId, WireMessage};
pub use connection::{ConnectionOptions, GatewayConnection, PingResult};
pub use manager::ConnectionManager;
pub use router::{JsonValidator, PayloadValidator, Subscription, SubscriptionId, TopicEvent};
pub use state::{ConnectionSnapshot, ConnectionState, ConnectionStats, ReconnectPolicy};
pub use transport::{Connector, MemoryConnector, WsConnector};

/// Command sent automatically after the socket opens
pub const AUTH_COMMAND: &str = "authenticate";

/// Round-trip probe
pub const PING_COMMAND: &str = "ping";

// ============================================================================
// IDENTITY
// ============================================================================

/// Gateway record id (stable key of the connection registry)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayId(String);

impl GatewayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GatewayId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for GatewayId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Who to connect to and how to authenticate; fixed for a connection's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayIdentity {
    pub id: GatewayId,
    pub url: String,
    pub credentials: Credentials,
}

impl GatewayIdentity {
    pub fn new(id: impl Into<GatewayId>, url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            credentials,
        }
    }

    /// Reject URLs the WebSocket connector could never open
    pub fn validate_url(&self) -> Result<(), crate::errors::GatewayError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| crate::errors::GatewayError::connect(&self.url, format!("invalid URL: {}", e)))?;
        match parsed.scheme() {
            "ws" | "wss" | "memory" => Ok(()),
            other => Err(crate::errors::GatewayError::connect(
                &self.url,
                format!("unsupported scheme '{}'", other),
            )),
        }
    }
}
