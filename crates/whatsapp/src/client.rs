//! Seam between the lifecycle core and the messaging-network client.
//!
//! The network client owns the wire protocol, encryption and pairing. The core
//! only needs to open a connection from stored credentials, observe its
//! events, and send text.

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use crate::store::Credentials;

/// Connection state carried by a [`ConnectionUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Details of the last disconnect, present on close updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastDisconnect {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One connection-state change. Any combination of fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionState>,
    #[serde(default)]
    pub last_disconnect: Option<LastDisconnect>,
    /// Fresh pairing payload; supersedes any earlier one.
    #[serde(default)]
    pub qr: Option<String>,
    /// Authenticated account id, reported once the connection is open.
    #[serde(default)]
    pub user: Option<String>,
}

impl ConnectionUpdate {
    pub fn opened(user: impl Into<String>) -> Self {
        Self {
            connection: Some(ConnectionState::Open),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn closed(status_code: Option<u16>) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(LastDisconnect {
                status_code,
                message: None,
            }),
            ..Self::default()
        }
    }

    pub fn qr(payload: impl Into<String>) -> Self {
        Self {
            qr: Some(payload.into()),
            ..Self::default()
        }
    }
}

/// Events delivered, in order, for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Connection(ConnectionUpdate),
    CredsUpdate(Credentials),
}

/// A group the account participates in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    #[serde(default)]
    pub subject: String,
}

/// A live connection handed out by a [`Connector`].
pub struct Connection {
    pub client: Arc<dyn NetworkClient>,
    pub events: mpsc::UnboundedReceiver<NetworkEvent>,
}

/// Opens connections to the network.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, creds: &Credentials) -> Result<Connection>;
}

/// Operations on an open connection. Implementations bound every call with
/// their transport timeout.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Resolve `jid` against the registration lookup. `None` if unregistered.
    async fn lookup(&self, jid: &str) -> Result<Option<String>>;

    async fn send_text(&self, jid: &str, text: &str) -> Result<()>;

    async fn participating_groups(&self) -> Result<Vec<GroupInfo>>;

    /// Invalidate the session on the network side.
    async fn logout(&self) -> Result<()>;

    /// Tear down the connection. Further events must not be delivered.
    async fn close(&self);
}
