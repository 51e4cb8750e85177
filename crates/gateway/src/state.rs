use std::sync::Arc;

use wagate_whatsapp::{ConnectionManager, JidFormat, StatusBroadcaster};

/// Shared gateway runtime state, cheaply cloneable via `Arc`.
pub struct GatewayState {
    pub version: String,
    pub manager: Arc<ConnectionManager>,
    pub broadcaster: Arc<StatusBroadcaster>,
    /// How `/send-message` numbers become recipient ids.
    pub jid: JidFormat,
}

impl GatewayState {
    pub fn new(
        manager: Arc<ConnectionManager>,
        broadcaster: Arc<StatusBroadcaster>,
        jid: JidFormat,
    ) -> Arc<Self> {
        Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            manager,
            broadcaster,
            jid,
        })
    }
}
