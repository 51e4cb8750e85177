//! Stdio bridge: the network client library runs in a sidecar process and is
//! driven with newline-delimited JSON-RPC over its stdin/stdout.
//!
//! Requests: `connect`, `onWhatsApp`, `sendMessage`,
//! `groupFetchAllParticipating`, `logout`.
//! Notifications from the bridge: `connection.update`, `creds.update`.
//!
//! One bridge process backs one connection. Closing the connection kills it.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    anyhow::Result,
    async_trait::async_trait,
    base64::{Engine, engine::general_purpose::STANDARD},
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, info, trace, warn},
};

use wagate_config::BridgeConfig;

use crate::{
    client::{Connection, ConnectionUpdate, Connector, GroupInfo, NetworkClient, NetworkEvent},
    error::BridgeError,
    store::{Credentials, ProtocolVersion},
};

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RpcError>,
    },
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

/// Credentials as exchanged with the bridge: the blob travels as base64.
#[derive(Debug, Serialize, Deserialize)]
struct WireCreds {
    #[serde(default)]
    version: [u32; 3],
    #[serde(default)]
    creds: String,
}

impl From<&Credentials> for WireCreds {
    fn from(c: &Credentials) -> Self {
        Self {
            version: c.version.0,
            creds: STANDARD.encode(&c.blob),
        }
    }
}

impl TryFrom<WireCreds> for Credentials {
    type Error = base64::DecodeError;

    fn try_from(w: WireCreds) -> Result<Self, Self::Error> {
        Ok(Self {
            version: ProtocolVersion(w.version),
            blob: STANDARD.decode(w.creds)?,
        })
    }
}

fn decode_notification(method: &str, params: Value) -> Option<NetworkEvent> {
    match method {
        "connection.update" => match serde_json::from_value::<ConnectionUpdate>(params) {
            Ok(update) => Some(NetworkEvent::Connection(update)),
            Err(e) => {
                warn!(error = %e, "malformed connection.update from bridge");
                None
            },
        },
        "creds.update" => {
            let creds = serde_json::from_value::<WireCreds>(params)
                .map_err(|e| e.to_string())
                .and_then(|w| Credentials::try_from(w).map_err(|e| e.to_string()));
            match creds {
                Ok(creds) => Some(NetworkEvent::CredsUpdate(creds)),
                Err(e) => {
                    warn!(error = %e, "malformed creds.update from bridge");
                    None
                },
            }
        },
        other => {
            trace!(method = other, "ignoring bridge notification");
            None
        },
    }
}

/// `onWhatsApp` answers with either one entry or a list of entries; a `jid`
/// on the first entry means the number is registered.
fn registered_jid(result: &Value) -> Option<String> {
    let entry = match result {
        Value::Array(items) => items.first()?,
        other => other,
    };
    entry.get("jid")?.as_str().map(str::to_string)
}

/// Groups arrive keyed by id or as a plain list.
fn parse_groups(result: Value) -> Result<Vec<GroupInfo>, serde_json::Error> {
    match result {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map.into_values().map(serde_json::from_value).collect(),
        other => serde_json::from_value(other),
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>>>>;

struct BridgeTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeTransport {
    async fn spawn(
        config: &BridgeConfig,
        timeout: Duration,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Arc<Self>, BridgeError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Closed("stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Closed("stdout".into()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        trace!(raw = %line, "bridge -> gateway");
                        match serde_json::from_str::<Incoming>(line) {
                            Ok(Incoming::Response { id, result, error }) => {
                                let outcome = match error {
                                    Some(err) => Err(BridgeError::Remote {
                                        code: err.code,
                                        message: err.message,
                                    }),
                                    None => Ok(result.unwrap_or(Value::Null)),
                                };
                                match reader_pending.lock().await.remove(&id) {
                                    Some(tx) => {
                                        let _ = tx.send(outcome);
                                    },
                                    None => warn!(id, "response for unknown bridge request"),
                                }
                            },
                            Ok(Incoming::Notification { method, params }) => {
                                if let Some(event) = decode_notification(&method, params)
                                    && events.send(event).is_err()
                                {
                                    debug!("event receiver dropped, stopping bridge reader");
                                    break;
                                }
                            },
                            Err(e) => warn!(error = %e, "unparseable line from bridge"),
                        }
                    },
                    Ok(None) => {
                        debug!("bridge stdout closed");
                        break;
                    },
                    Err(e) => {
                        warn!(error = %e, "error reading from bridge");
                        break;
                    },
                }
            }
            // Outstanding requests fail with `Closed` once their senders drop.
            reader_pending.lock().await.clear();
        });

        Ok(Arc::new(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            reader: Mutex::new(Some(handle)),
        }))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write(id, method, params).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::Closed(method.into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BridgeError::Timeout(method.into()))
            },
        }
    }

    async fn write(&self, id: u64, method: &str, params: Option<Value>) -> Result<(), BridgeError> {
        let mut payload = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;
        payload.push('\n');
        trace!(method, id, "gateway -> bridge");

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn kill(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(error = %e, "bridge already exited");
        }
    }
}

// ── Connector / client ───────────────────────────────────────────────────────

/// Opens each connection by spawning a fresh bridge process.
pub struct BridgeConnector {
    config: BridgeConfig,
    timeout: Duration,
}

impl BridgeConnector {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            config: config.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, creds: &Credentials) -> Result<Connection> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = BridgeTransport::spawn(&self.config, self.timeout, tx).await?;
        info!(command = %self.config.command, "bridge started");

        let params = serde_json::to_value(WireCreds::from(creds))?;
        if let Err(e) = transport.request("connect", Some(params)).await {
            transport.kill().await;
            return Err(e.into());
        }

        Ok(Connection {
            client: Arc::new(BridgeClient { transport }),
            events: rx,
        })
    }
}

struct BridgeClient {
    transport: Arc<BridgeTransport>,
}

#[async_trait]
impl NetworkClient for BridgeClient {
    async fn lookup(&self, jid: &str) -> Result<Option<String>> {
        let result = self
            .transport
            .request("onWhatsApp", Some(json!({ "jid": jid })))
            .await?;
        Ok(registered_jid(&result))
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<()> {
        self.transport
            .request(
                "sendMessage",
                Some(json!({ "jid": jid, "content": { "text": text } })),
            )
            .await?;
        Ok(())
    }

    async fn participating_groups(&self) -> Result<Vec<GroupInfo>> {
        let result = self
            .transport
            .request("groupFetchAllParticipating", None)
            .await?;
        Ok(parse_groups(result)?)
    }

    async fn logout(&self) -> Result<()> {
        self.transport.request("logout", None).await?;
        Ok(())
    }

    async fn close(&self) {
        self.transport.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_result_shapes() {
        assert_eq!(
            registered_jid(&json!({ "jid": "628@s.whatsapp.net", "exists": true })),
            Some("628@s.whatsapp.net".into())
        );
        assert_eq!(
            registered_jid(&json!([{ "jid": "628@s.whatsapp.net" }])),
            Some("628@s.whatsapp.net".into())
        );
        assert_eq!(registered_jid(&json!([])), None);
        assert_eq!(registered_jid(&Value::Null), None);
    }

    #[test]
    fn groups_keyed_or_listed() {
        let keyed = json!({ "1-2@g.us": { "id": "1-2@g.us", "subject": "Team" } });
        assert_eq!(parse_groups(keyed).unwrap(), vec![GroupInfo {
            id: "1-2@g.us".into(),
            subject: "Team".into(),
        }]);
        let listed = json!([{ "id": "3@g.us" }]);
        assert_eq!(parse_groups(listed).unwrap()[0].subject, "");
        assert!(parse_groups(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn creds_notification_decodes_blob() {
        let event = decode_notification(
            "creds.update",
            json!({ "version": [2, 3000, 5], "creds": STANDARD.encode(b"keys") }),
        );
        assert_eq!(
            event,
            Some(NetworkEvent::CredsUpdate(Credentials {
                version: ProtocolVersion([2, 3000, 5]),
                blob: b"keys".to_vec(),
            }))
        );
        assert_eq!(
            decode_notification("creds.update", json!({ "creds": "%%%" })),
            None
        );
    }

    #[test]
    fn close_notification_decodes_status() {
        let event = decode_notification(
            "connection.update",
            json!({ "connection": "close", "lastDisconnect": { "statusCode": 515 } }),
        );
        assert_eq!(
            event,
            Some(NetworkEvent::Connection(ConnectionUpdate::closed(Some(515))))
        );
        assert_eq!(decode_notification("messages.upsert", json!({})), None);
    }

    #[cfg(unix)]
    fn shell(script: &str) -> BridgeConfig {
        BridgeConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..BridgeConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_bridge_round_trip() {
        // Emits one QR notification, then echoes every request back, which
        // parses as a response with a null result.
        let config = shell(
            r#"printf '%s\n' '{"jsonrpc":"2.0","method":"connection.update","params":{"qr":"ref-1"}}'; exec cat"#,
        );
        let connector = BridgeConnector::new(&config);
        let Connection { client, mut events } =
            connector.connect(&Credentials::default()).await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(NetworkEvent::Connection(ConnectionUpdate::qr("ref-1")))
        );
        assert_eq!(client.lookup("628@s.whatsapp.net").await.unwrap(), None);
        client.send_text("628@s.whatsapp.net", "hi").await.unwrap();

        client.close().await;
        assert_eq!(events.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_bridge_times_out() {
        let connector =
            BridgeConnector::new(&shell("sleep 5")).with_timeout(Duration::from_millis(100));
        let err = connector
            .connect(&Credentials::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn missing_command_fails_to_connect() {
        let config = BridgeConfig {
            command: "wagate_nonexistent_bridge_42".into(),
            ..BridgeConfig::default()
        };
        assert!(
            BridgeConnector::new(&config)
                .connect(&Credentials::default())
                .await
                .is_err()
        );
    }
}
