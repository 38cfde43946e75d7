/// Registry of gateway connections
///
/// Holds at most one `GatewayConnection` per gateway id. Lookup and insert
/// happen under a single lock acquisition, so concurrent `connect()` calls
/// for one gateway end up sharing a single actor (and a single socket).
///
/// The manager is an explicit instance: binaries create it with `init` and
/// tear it down with `shutdown`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::connection::{ConnectionOptions, GatewayConnection};
use super::state::{ConnectionSnapshot, ConnectionState};
use super::transport::Connector;
use super::{GatewayId, GatewayIdentity};
use crate::errors::GatewayError;
use crate::logger::{self, LogTag};

pub struct ConnectionManager {
    connections: Mutex<HashMap<GatewayId, GatewayConnection>>,
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    pub fn init(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Arc<Self> {
        logger::debug(
            LogTag::Manager,
            &format!("Connection manager initialized ({} connector)", connector.name()),
        );
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            connector,
            options,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Existing connection for the identity, or a new one registered under its id
    ///
    /// A registered connection whose target changed is replaced only while it
    /// is idle (Disconnected or Error); an active one is kept as is.
    pub async fn get_or_create(&self, identity: GatewayIdentity) -> Result<GatewayConnection, GatewayError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionClosed);
        }

        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(&identity.id) {
            let same_target = existing.identity() == &identity;
            if existing.is_alive() && (same_target || existing.state().is_active()) {
                if !same_target {
                    logger::warning(
                        LogTag::Manager,
                        &format!(
                            "Gateway {}: identity changed while connection is {}, keeping current one",
                            identity.id,
                            existing.state()
                        ),
                    );
                }
                return Ok(existing.clone());
            }

            if let Some(stale) = connections.remove(&identity.id) {
                logger::info(
                    LogTag::Manager,
                    &format!("Gateway {}: replacing idle connection", identity.id),
                );
                stale.shutdown().await;
            }
        }

        let id = identity.id.clone();
        let conn = GatewayConnection::spawn(identity, self.connector.clone(), self.options.clone());
        connections.insert(id.clone(), conn.clone());
        logger::debug(
            LogTag::Manager,
            &format!("Gateway {}: connection registered ({} total)", id, connections.len()),
        );
        Ok(conn)
    }

    /// Connect (or join the connect in progress) and return the authenticated handle
    pub async fn connect(&self, identity: GatewayIdentity) -> Result<GatewayConnection, GatewayError> {
        let conn = self.get_or_create(identity).await?;
        conn.connect().await?;
        logger::info(
            LogTag::Manager,
            &format!("Gateway {} ready", conn.id()),
        );
        Ok(conn)
    }

    pub async fn connection(&self, id: &GatewayId) -> Option<GatewayConnection> {
        self.connections.lock().await.get(id).cloned()
    }

    /// Disconnect and forget one gateway; other gateways are unaffected
    pub async fn disconnect(&self, id: &GatewayId) -> bool {
        let removed = self.connections.lock().await.remove(id);
        match removed {
            Some(conn) => {
                conn.shutdown().await;
                logger::info(LogTag::Manager, &format!("Gateway {} removed", id));
                true
            }
            None => false,
        }
    }

    pub async fn states(&self) -> HashMap<GatewayId, ConnectionState> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|(id, conn)| (id.clone(), conn.state()))
            .collect()
    }

    pub async fn snapshot(&self, id: &GatewayId) -> Option<ConnectionSnapshot> {
        self.connections.lock().await.get(id).map(|conn| conn.snapshot())
    }

    pub async fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .connections
            .lock()
            .await
            .values()
            .map(|conn| conn.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.gateway_id.cmp(&b.gateway_id));
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Disconnect everything; later `connect()` calls fail
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<GatewayConnection> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for conn in drained {
            conn.shutdown().await;
        }
        logger::info(
            LogTag::Manager,
            &format!("Connection manager stopped ({} connection(s) closed)", count),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::simulator::{SimulatedGateway, SimulatorOptions};
    use crate::gateway::Credentials;
    use std::time::Duration;

    fn identity(id: &str) -> GatewayIdentity {
        GatewayIdentity::new(id, format!("memory://{}", id), Credentials::new("admin", "secret"))
    }

    fn options() -> ConnectionOptions {
        let mut options = ConnectionOptions::default();
        options.command_timeout = Duration::from_millis(500);
        options.auth_timeout = Duration::from_millis(500);
        options
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_connection() {
        let gateway = SimulatedGateway::start(SimulatorOptions::default());
        let manager = ConnectionManager::init(Arc::new(gateway.connector()), options());

        let (a, b) = tokio::join!(manager.connect(identity("gw-1")), manager.connect(identity("gw-1")));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.id(), b.id());
        assert_eq!(manager.len().await, 1);
        assert_eq!(gateway.control().sessions_opened(), 1);
        assert_eq!(a.state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_gateways_are_isolated() {
        let gateway = SimulatedGateway::start(SimulatorOptions::default());
        let manager = ConnectionManager::init(Arc::new(gateway.connector()), options());

        let gw1 = manager.connect(identity("gw-1")).await.unwrap();
        let gw2 = manager.connect(identity("gw-2")).await.unwrap();

        assert!(manager.disconnect(gw1.id()).await);
        assert!(!manager.disconnect(gw1.id()).await);
        assert_eq!(gw1.state(), ConnectionState::Disconnected);
        assert_eq!(gw2.state(), ConnectionState::Authenticated);
        assert!(gw2.ping().await.is_ok());

        let states = manager.states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states.get(&GatewayId::from("gw-2")), Some(&ConnectionState::Authenticated));
    }

    #[tokio::test]
    async fn test_failed_connection_is_replaced_with_new_identity() {
        let gateway = SimulatedGateway::start(SimulatorOptions::default());
        let manager = ConnectionManager::init(Arc::new(gateway.connector()), options());

        let mut wrong = identity("gw-1");
        wrong.credentials = Credentials::new("admin", "wrong");
        let err = manager.connect(wrong).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth { .. }));
        let snapshot = manager.snapshot(&GatewayId::from("gw-1")).await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Error);

        let conn = manager.connect(identity("gw-1")).await.unwrap();
        assert_eq!(conn.identity().credentials.password, "secret");
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let gateway = SimulatedGateway::start(SimulatorOptions::default());
        let manager = ConnectionManager::init(Arc::new(gateway.connector()), options());
        let conn = manager.connect(identity("gw-1")).await.unwrap();

        manager.shutdown().await;
        assert!(manager.is_empty().await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            manager.connect(identity("gw-1")).await.unwrap_err(),
            GatewayError::ConnectionClosed
        );
    }
}
