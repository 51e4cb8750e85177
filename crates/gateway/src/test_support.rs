use std::sync::Arc;

use {
    axum::Router,
    wagate_whatsapp::{
        ConnectionManager, ConnectionSnapshot, ConnectionUpdate, Connector, JidFormat,
        ReconnectPolicy, SessionStore, StatusBroadcaster, testing::FakeConnector,
    },
};

use crate::{server::build_gateway_app, state::GatewayState};

/// Gateway wired to an in-memory connector.
pub(crate) struct TestGateway {
    pub state: Arc<GatewayState>,
    pub connector: Arc<FakeConnector>,
}

impl TestGateway {
    pub fn new() -> Self {
        let connector = FakeConnector::new();
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        let store = Arc::new(SessionStore::temporary().unwrap());
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let manager = ConnectionManager::new(
            dyn_connector,
            store,
            Arc::clone(&broadcaster),
            ReconnectPolicy::default(),
        );
        Self {
            state: GatewayState::new(manager, broadcaster, JidFormat::default()),
            connector,
        }
    }

    pub fn app(&self) -> Router {
        build_gateway_app(Arc::clone(&self.state))
    }

    /// Start the manager and open the connection.
    pub async fn connect(&self) {
        let mut phases = self.state.manager.subscribe();
        self.state.manager.start().await.unwrap();
        self.connector
            .emit(ConnectionUpdate::opened("6281111@s.whatsapp.net"));
        phases
            .wait_for(ConnectionSnapshot::is_connected)
            .await
            .map(|_| ())
            .unwrap();
    }
}
