/// Socket seam between a connection and the network
///
/// A `Connector` opens a socket for a gateway identity and hands back a pair
/// of channels: text frames out, `TransportEvent`s in. The connection actor
/// never touches the socket type itself, which lets tests swap the WebSocket
/// for an in-memory pipe served by the simulator.
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::codec::{self, WireMessage};
use super::{GatewayId, GatewayIdentity};
use crate::errors::GatewayError;
use crate::logger::{self, LogTag};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(String),
    Binary(Vec<u8>),
    /// Peer closed the socket, with its close reason if any
    Closed(Option<String>),
    Error(String),
}

/// An open socket as seen by the connection actor
///
/// Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct SocketChannels {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, identity: &GatewayIdentity) -> Result<SocketChannels, GatewayError>;

    fn name(&self) -> &'static str;
}

/// Next inbound event; never resolves while no socket is open
pub(crate) async fn next_transport_event(socket: &mut Option<SocketChannels>) -> TransportEvent {
    match socket {
        Some(channels) => channels
            .inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

// ============================================================================
// WEBSOCKET
// ============================================================================

/// Production connector over tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, identity: &GatewayIdentity) -> Result<SocketChannels, GatewayError> {
        identity.validate_url()?;

        let (ws_stream, _) = connect_async(identity.url.as_str())
            .await
            .map_err(|e| GatewayError::connect(&identity.url, e.to_string()))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let gateway_id = identity.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(text) => {
                                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                                    let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                                    break;
                                }
                            }
                            None => {
                                // Connection dropped its end: close politely
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    incoming = ws_receiver.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if inbound_tx.send(TransportEvent::Frame(text)).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Binary(bytes))) => {
                                if inbound_tx.send(TransportEvent::Binary(bytes)).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame
                                    .map(|f| f.reason.to_string())
                                    .filter(|r| !r.is_empty());
                                let _ = inbound_tx.send(TransportEvent::Closed(reason));
                                break;
                            }
                            Some(Ok(_)) => {
                                // ping/pong are answered by tungstenite
                            }
                            Some(Err(e)) => {
                                let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                            None => {
                                let _ = inbound_tx.send(TransportEvent::Closed(None));
                                break;
                            }
                        }
                    }
                }
            }

            logger::debug(
                LogTag::Connection,
                &format!("WebSocket pump for gateway {} stopped", gateway_id),
            );
        });

        Ok(SocketChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

// ============================================================================
// IN-MEMORY
// ============================================================================

/// Gateway side of one in-memory socket
#[derive(Debug)]
pub struct GatewaySession {
    pub gateway_id: GatewayId,
    pub target: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl GatewaySession {
    /// Next raw frame from the client; None once the client closed the socket
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next decodable message from the client, skipping anything malformed
    pub async fn recv_message(&mut self) -> Option<WireMessage> {
        while let Some(frame) = self.from_client.recv().await {
            match codec::decode(&frame) {
                Ok(message) => return Some(message),
                Err(e) => logger::warning(
                    LogTag::Simulator,
                    &format!("Gateway session dropped malformed client frame: {}", e),
                ),
            }
        }
        None
    }

    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Frame(frame.into())).is_ok()
    }

    pub fn send_message(&self, message: &WireMessage) -> bool {
        match codec::encode(message) {
            Ok(frame) => self.send_raw(frame),
            Err(_) => false,
        }
    }

    /// Close from the gateway side; the client sees an unexpected close
    pub fn close(self, reason: Option<&str>) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed(reason.map(str::to_string)));
    }

    /// Report a socket error to the client, as a broken network would
    pub fn fail(self, message: &str) {
        let _ = self.to_client.send(TransportEvent::Error(message.to_string()));
    }

    /// Whether the client has dropped its end
    pub fn is_client_gone(&self) -> bool {
        self.to_client.is_closed()
    }

    /// Split into independent send and receive halves
    pub fn split(self) -> (SessionSender, mpsc::UnboundedReceiver<String>) {
        (
            SessionSender {
                to_client: self.to_client,
            },
            self.from_client,
        )
    }
}

/// Cloneable sending half of a `GatewaySession`
#[derive(Debug, Clone)]
pub struct SessionSender {
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl SessionSender {
    pub fn send_message(&self, message: &WireMessage) -> bool {
        match codec::encode(message) {
            Ok(frame) => self.to_client.send(TransportEvent::Frame(frame)).is_ok(),
            Err(_) => false,
        }
    }

    pub fn send_event(&self, event: TransportEvent) -> bool {
        self.to_client.send(event).is_ok()
    }

    pub fn is_client_gone(&self) -> bool {
        self.to_client.is_closed()
    }
}

/// Connector whose sockets are channel pairs accepted by an in-process gateway
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    sessions: mpsc::UnboundedSender<GatewaySession>,
    refusing: Arc<AtomicBool>,
    opened: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Connector plus the acceptor end receiving one session per `open`
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewaySession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: tx,
                refusing: Arc::new(AtomicBool::new(false)),
                opened: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Make subsequent `open` calls fail as if the host were unreachable
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn is_refusing(&self) -> bool {
        self.refusing.load(Ordering::SeqCst)
    }

    /// Sockets successfully opened so far
    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, identity: &GatewayIdentity) -> Result<SocketChannels, GatewayError> {
        if self.is_refusing() {
            return Err(GatewayError::connect(&identity.url, "connection refused"));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let session = GatewaySession {
            gateway_id: identity.id.clone(),
            target: identity.url.clone(),
            from_client: outbound_rx,
            to_client: inbound_tx,
        };

        self.sessions
            .send(session)
            .map_err(|_| GatewayError::connect(&identity.url, "no gateway listening"))?;
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(SocketChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Credentials;
    use serde_json::json;

    fn identity() -> GatewayIdentity {
        GatewayIdentity::new("gw-1", "memory://gw-1", Credentials::new("admin", "secret"))
    }

    #[tokio::test]
    async fn test_memory_socket_round_trip() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let mut socket = Some(connector.open(&identity()).await.unwrap());
        let mut session = acceptor.recv().await.unwrap();
        assert_eq!(session.gateway_id.as_str(), "gw-1");
        assert_eq!(connector.opened_count(), 1);

        let frame = codec::encode(&WireMessage::command(1, "ping", json!({}))).unwrap();
        socket.as_ref().unwrap().outbound.send(frame).unwrap();
        assert_eq!(
            session.recv_message().await,
            Some(WireMessage::command(1, "ping", json!({})))
        );

        assert!(session.send_message(&WireMessage::response_ok(1, json!({"pong": true}))));
        match next_transport_event(&mut socket).await {
            TransportEvent::Frame(text) => {
                assert_eq!(codec::decode(&text).unwrap(), WireMessage::response_ok(1, json!({"pong": true})))
            }
            other => panic!("unexpected {:?}", other),
        }

        session.close(Some("maintenance"));
        assert_eq!(
            next_transport_event(&mut socket).await,
            TransportEvent::Closed(Some("maintenance".to_string()))
        );
    }

    #[tokio::test]
    async fn test_dropped_session_reads_as_closed() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let mut socket = Some(connector.open(&identity()).await.unwrap());
        drop(acceptor.recv().await.unwrap());
        assert_eq!(next_transport_event(&mut socket).await, TransportEvent::Closed(None));
    }

    #[tokio::test]
    async fn test_refusing_connector() {
        let (connector, _acceptor) = MemoryConnector::new();
        connector.set_refusing(true);
        let err = connector.open(&identity()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Connect { .. }));

        let (connector, acceptor) = MemoryConnector::new();
        drop(acceptor);
        assert!(connector.open(&identity()).await.is_err());
    }

    #[tokio::test]
    async fn test_ws_connector_rejects_bad_scheme() {
        let identity = GatewayIdentity::new("gw-2", "http://localhost:1", Credentials::new("a", "b"));
        assert!(WsConnector::new().open(&identity).await.is_err());
    }
}
