//! Config schema types (server, whatsapp session, connectors, reconnect policy).

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagateConfig {
    pub server: ServerConfig,
    pub whatsapp: WhatsAppConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

/// WhatsApp session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Where the session credentials live. Defaults to `<data_dir>/session`.
    pub session_dir: Option<PathBuf>,

    /// Country calling code prepended to local numbers (leading `0` dropped).
    pub country_code: String,

    /// Domain suffix of user addresses on the network.
    pub user_domain: String,

    /// Which network client opens connections.
    pub connector: ConnectorKind,
    pub native: NativeConfig,
    pub bridge: BridgeConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            session_dir: None,
            country_code: "62".into(),
            user_domain: "s.whatsapp.net".into(),
            connector: ConnectorKind::default(),
            native: NativeConfig::default(),
            bridge: BridgeConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl WhatsAppConfig {
    /// Configured session directory, or `<data_dir>/session`.
    pub fn session_path(&self) -> PathBuf {
        self.session_dir
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("session"))
    }
}

/// Network client implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    /// In-process client; protocol state lives in the session store.
    #[default]
    Native,
    /// External sidecar spoken to over stdio (see [`BridgeConfig`]).
    Bridge,
}

/// In-process client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Upper bound for sends, lookups and group queries.
    pub request_timeout_secs: u64,
    /// Pin the web client version instead of fetching the current one.
    pub version: Option<[u32; 3]>,
    /// Name shown under "Linked devices" on the phone.
    pub device_name: Option<String>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            version: None,
            device_name: Some("wagate".into()),
        }
    }
}

/// Sidecar process hosting the network client library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Upper bound for every request sent to the bridge (send, lookup, logout).
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "wagate-bridge".into(),
            args: Vec::new(),
            env: HashMap::new(),
            request_timeout_secs: 30,
        }
    }
}

/// How the delay between reconnection attempts evolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Reconnection policy for recoverable disconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub delay_secs: u64,
    pub backoff: BackoffKind,
    /// Ceiling for exponential backoff. Ignored for `fixed`.
    pub max_delay_secs: u64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            backoff: BackoffKind::Fixed,
            max_delay_secs: 60,
            jitter: false,
        }
    }
}
