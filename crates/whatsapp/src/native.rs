//! In-process network client built on `whatsapp-rust`.
//!
//! Each [`NativeConnector::connect`] builds a fresh client whose automatic
//! reconnection is switched off: one client is one connection, and the
//! lifecycle core decides what happens after it closes. Client events are
//! funnelled into the connection's [`NetworkEvent`] stream by a pump task.

use std::{
    future::Future,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use {
    anyhow::{Result, anyhow},
    async_trait::async_trait,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
    wacore::types::events::Event,
    wacore_binary::{builder::NodeBuilder, jid::Jid, node::NodeContent},
    wagate_config::NativeConfig,
    waproto::whatsapp as wa,
    whatsapp_rust::{Client, bot::Bot, jid_utils::server_jid, request::InfoQuery},
    whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory,
    whatsapp_rust_ureq_http_client::UreqHttpClient,
};

use crate::{
    client::{
        Connection, ConnectionState, ConnectionUpdate, Connector, GroupInfo, LastDisconnect,
        NetworkClient, NetworkEvent,
    },
    disconnect::status,
    native_store::{SledBackend, device_credentials},
    store::{Credentials, SessionStore},
};

/// How long to wait for sibling events once the connection starts closing.
/// The client dispatches each event on its own task, so a logout and the
/// disconnect that follows it can arrive in either order.
const SETTLE: Duration = Duration::from_millis(250);

enum Signal {
    Event(Box<Event>),
    /// The client's run loop returned.
    Stopped,
}

pub struct NativeConnector {
    store: Arc<SessionStore>,
    config: NativeConfig,
}

impl NativeConnector {
    pub fn new(store: Arc<SessionStore>, config: &NativeConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Connector for NativeConnector {
    async fn connect(&self, creds: &Credentials) -> Result<Connection> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backend = Arc::new(SledBackend::open(&self.store, creds, events_tx.clone())?);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let forward = signals_tx.clone();
        let mut builder = Bot::builder()
            .with_backend(backend.clone())
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let forward = is_lifecycle(&event).then(|| forward.clone());
                async move {
                    if let Some(forward) = forward {
                        let _ = forward.send(Signal::Event(Box::new(event)));
                    }
                }
            });
        if let Some([primary, secondary, tertiary]) = self.config.version {
            builder = builder.with_version((primary, secondary, tertiary));
        }
        if let Some(name) = &self.config.device_name {
            builder = builder.with_os_info(Some(name.clone()), None);
        }

        let mut bot = builder.build().await?;
        let client = bot.client();
        client.enable_auto_reconnect.store(false, Ordering::Relaxed);
        let run = bot.run().await?;
        info!(paired = !creds.is_fresh(), "client started");

        tokio::spawn(async move {
            if let Err(e) = run.await {
                warn!(error = %e, "client task ended abnormally");
            }
            let _ = signals_tx.send(Signal::Stopped);
        });
        tokio::spawn(pump(Arc::clone(&client), signals_rx, events_tx));

        Ok(Connection {
            client: Arc::new(NativeClient {
                client,
                backend,
                timeout: Duration::from_secs(self.config.request_timeout_secs),
            }),
            events: events_rx,
        })
    }
}

struct NativeClient {
    client: Arc<Client>,
    backend: Arc<SledBackend>,
    timeout: Duration,
}

impl NativeClient {
    async fn bounded<T, F>(&self, what: &str, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
        T: Send,
    {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| anyhow!("{what} timed out after {}s", self.timeout.as_secs()))?
    }
}

#[async_trait]
impl NetworkClient for NativeClient {
    async fn lookup(&self, jid: &str) -> Result<Option<String>> {
        let target: Jid = jid.parse()?;
        let contacts = self.client.contacts();
        let results = self
            .bounded("lookup", contacts.is_on_whatsapp(&[target.user.as_str()]))
            .await?;
        Ok(results
            .into_iter()
            .find(|r| r.is_registered)
            .map(|r| r.jid.to_non_ad().to_string()))
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<()> {
        let to: Jid = jid.parse()?;
        let message = wa::Message {
            conversation: Some(text.to_string()),
            ..Default::default()
        };
        let id = self
            .bounded("send", self.client.send_message(to, message))
            .await?;
        debug!(to = jid, id = %id, "message sent");
        Ok(())
    }

    async fn participating_groups(&self) -> Result<Vec<GroupInfo>> {
        let groups = self.client.groups();
        let groups = self
            .bounded("group query", groups.get_participating())
            .await?;
        Ok(groups
            .into_values()
            .map(|g| GroupInfo {
                id: g.id.to_string(),
                subject: g.subject,
            })
            .collect())
    }

    async fn logout(&self) -> Result<()> {
        let Some(me) = self.client.get_pn().await else {
            debug!("not paired, nothing to log out");
            return Ok(());
        };
        let node = NodeBuilder::new("remove-companion-device")
            .attr("jid", me.to_string())
            .attr("reason", "user_initiated")
            .build();
        let query = InfoQuery::set("md", server_jid(), Some(NodeContent::Nodes(vec![node])));
        self.bounded("logout", async { Ok(self.client.send_iq(query).await?) })
            .await?;
        info!(device = %me, "companion device removed");
        Ok(())
    }

    async fn close(&self) {
        self.backend.retire();
        self.client.disconnect().await;
    }
}

fn is_lifecycle(event: &Event) -> bool {
    matches!(
        event,
        Event::PairingQrCode { .. }
            | Event::PairSuccess(_)
            | Event::PairError(_)
            | Event::Connected(_)
            | Event::Disconnected(_)
            | Event::LoggedOut(_)
            | Event::StreamReplaced(_)
            | Event::TemporaryBan(_)
            | Event::ClientOutdated(_)
            | Event::ConnectFailure(_)
            | Event::StreamError(_)
    )
}

fn closed(code: u16, message: impl Into<String>) -> ConnectionUpdate {
    ConnectionUpdate {
        connection: Some(ConnectionState::Close),
        last_disconnect: Some(LastDisconnect {
            status_code: Some(code),
            message: Some(message.into()),
        }),
        ..ConnectionUpdate::default()
    }
}

/// Close update for `event`, or `None` if it does not end the connection.
/// A plain disconnect right after pairing is the server asking for a
/// restart with the new credentials.
fn close_update(event: &Event, paired: bool) -> Option<ConnectionUpdate> {
    let update = match event {
        Event::LoggedOut(out) => closed(
            status::LOGGED_OUT,
            format!("logged out (code {})", out.reason.code()),
        ),
        Event::StreamReplaced(_) => closed(
            status::CONNECTION_REPLACED,
            "another client opened this session",
        ),
        Event::TemporaryBan(ban) => closed(
            status::CONNECTION_CLOSED,
            format!(
                "temporarily banned for {}s: {}",
                ban.expire.num_seconds(),
                ban.code
            ),
        ),
        Event::ClientOutdated(_) => closed(405, "client version rejected as outdated"),
        Event::ConnectFailure(failure) => {
            let code = if failure.reason.is_logged_out() {
                status::LOGGED_OUT
            } else if failure.reason.should_reconnect() {
                status::CONNECTION_CLOSED
            } else {
                u16::try_from(failure.reason.code()).unwrap_or(0)
            };
            closed(code, failure.message.clone())
        },
        Event::StreamError(error) => {
            closed(status::CONNECTION_CLOSED, format!("stream error {}", error.code))
        },
        Event::Disconnected(_) if paired => {
            closed(status::RESTART_REQUIRED, "restart after pairing")
        },
        Event::Disconnected(_) => closed(status::CONNECTION_CLOSED, "connection lost"),
        _ => return None,
    };
    Some(update)
}

/// Pick the close update for a burst of closing events. A specific cause
/// (logout, replacement, failure) wins over the bare disconnect that
/// accompanies it.
fn settled_close(pending: &[Event], paired: bool) -> ConnectionUpdate {
    let paired = paired || pending.iter().any(|e| matches!(e, Event::PairSuccess(_)));
    pending
        .iter()
        .filter(|e| !matches!(e, Event::Disconnected(_)))
        .find_map(|e| close_update(e, paired))
        .or_else(|| pending.iter().find_map(|e| close_update(e, paired)))
        .unwrap_or_else(|| closed(status::CONNECTION_CLOSED, "client stopped"))
}

fn emit(events: &mpsc::UnboundedSender<NetworkEvent>, update: ConnectionUpdate) {
    let _ = events.send(NetworkEvent::Connection(update));
}

/// Hand the current device record to the lifecycle core, once paired.
async fn flush_device(client: &Client, events: &mpsc::UnboundedSender<NetworkEvent>) {
    let device = client
        .persistence_manager()
        .get_device_snapshot()
        .await
        .to_serializable();
    if let Some(creds) = device_credentials(&device) {
        let _ = events.send(NetworkEvent::CredsUpdate(creds));
    }
}

/// Translate client events until the connection closes. Exactly one close
/// update is emitted, after which the pump ends.
async fn pump(
    client: Arc<Client>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<NetworkEvent>,
) {
    let mut paired = false;
    while let Some(signal) = signals.recv().await {
        let first = match signal {
            Signal::Stopped => None,
            Signal::Event(event) => match *event {
                Event::PairingQrCode { code, .. } => {
                    emit(&events, ConnectionUpdate::qr(code));
                    continue;
                },
                Event::PairSuccess(ok) => {
                    paired = true;
                    info!(id = %ok.id, platform = %ok.platform, "pairing accepted");
                    flush_device(&client, &events).await;
                    continue;
                },
                Event::PairError(err) => {
                    warn!(error = %err.error, "pairing rejected");
                    continue;
                },
                Event::Connected(_) => {
                    flush_device(&client, &events).await;
                    let update = match client.get_pn().await {
                        Some(pn) => ConnectionUpdate::opened(pn.to_non_ad().to_string()),
                        None => ConnectionUpdate {
                            connection: Some(ConnectionState::Open),
                            ..ConnectionUpdate::default()
                        },
                    };
                    emit(&events, update);
                    continue;
                },
                other => Some(other),
            },
        };

        tokio::time::sleep(SETTLE).await;
        let mut pending: Vec<Event> = first.into_iter().collect();
        while let Ok(signal) = signals.try_recv() {
            if let Signal::Event(event) = signal {
                pending.push(*event);
            }
        }
        flush_device(&client, &events).await;
        let update = settled_close(&pending, paired);
        debug!(
            status = ?update.last_disconnect.as_ref().and_then(|d| d.status_code),
            "client connection ended"
        );
        emit(&events, update);
        return;
    }
}
