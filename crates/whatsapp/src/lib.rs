//! WhatsApp session lifecycle: pairing, persistence, reconnection and sends.
//!
//! The [`ConnectionManager`] owns the one connection to the network. It opens
//! connections through a [`Connector`] (in process with [`NativeConnector`],
//! or through a sidecar with [`BridgeConnector`]), persists credentials to a
//! [`SessionStore`], and relays pairing status to the operator through the
//! [`StatusBroadcaster`].

pub mod bridge;
pub mod broadcast;
pub mod client;
pub mod disconnect;
pub mod error;
pub mod jid;
pub mod manager;
pub mod native;
pub mod native_store;
pub mod qr;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use {
    bridge::BridgeConnector,
    broadcast::{ControlEvent, StatusBroadcaster, StatusUpdate, SubscriberId},
    client::{Connection, ConnectionUpdate, Connector, GroupInfo, NetworkClient, NetworkEvent},
    disconnect::{DisconnectReason, RecoverableCause},
    error::{BridgeError, SendError, StoreError},
    jid::JidFormat,
    manager::{
        Backoff, ConnectionManager, ConnectionPhase, ConnectionSnapshot, ReconnectPolicy,
    },
    native::NativeConnector,
    store::{Credentials, ProtocolVersion, SessionStore},
};
