//! Single-subscriber status relay for the operator control channel.
//!
//! Exactly one operator watches the pairing flow at a time. Attaching a new
//! subscriber replaces the previous one; there is no fan-out and no queue.
//! The only history kept is the current phase, replayed on attach.

use std::sync::atomic::{AtomicU64, Ordering};

use {
    serde::Serialize,
    tokio::sync::{Mutex, mpsc},
    tracing::{debug, trace, warn},
};

use crate::qr;

pub const ICON_CHECK: &str = "./assets/check.svg";
pub const ICON_LOADER: &str = "./assets/loader.gif";

/// Display phase published by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// A pairing payload is waiting to be scanned.
    Qr(String),
    /// Connecting or closed with nothing to scan yet.
    Loading,
    /// Pairing finished and the connection opened.
    QrScanned,
    Connected,
}

impl StatusUpdate {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Qr(_) => "qr",
            Self::Loading => "loading",
            Self::QrScanned => "qrscanned",
            Self::Connected => "connected",
        }
    }
}

/// Frame delivered to the subscriber, serialized as `{"event": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ControlEvent {
    /// Rendered QR image as a `data:` URL.
    Qr(String),
    /// Status icon path.
    QrStatus(String),
    Log(String),
}

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    sender: mpsc::UnboundedSender<ControlEvent>,
}

#[derive(Default)]
struct Slot {
    subscriber: Option<Subscriber>,
    connected: bool,
    qr: Option<String>,
}

impl Slot {
    fn track(&mut self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Qr(payload) => {
                self.qr = Some(payload.clone());
                self.connected = false;
            },
            StatusUpdate::Loading => {
                self.qr = None;
                self.connected = false;
            },
            StatusUpdate::QrScanned => self.qr = None,
            StatusUpdate::Connected => {
                self.qr = None;
                self.connected = true;
            },
        }
    }

    fn current(&self) -> StatusUpdate {
        if self.connected {
            StatusUpdate::Connected
        } else if let Some(qr) = &self.qr {
            StatusUpdate::Qr(qr.clone())
        } else {
            StatusUpdate::Loading
        }
    }

    fn deliver(&mut self, update: &StatusUpdate) {
        let Some(subscriber) = &self.subscriber else {
            trace!(tag = update.tag(), "no control subscriber, dropping status");
            return;
        };

        let delivered = render(update)
            .into_iter()
            .all(|event| subscriber.sender.send(event).is_ok());
        if !delivered {
            debug!(subscriber = subscriber.id, "control subscriber went away");
            self.subscriber = None;
        }
    }
}

fn render(update: &StatusUpdate) -> Vec<ControlEvent> {
    let status = |icon: &str, log: &str| {
        vec![
            ControlEvent::QrStatus(icon.into()),
            ControlEvent::Log(log.into()),
        ]
    };

    match update {
        StatusUpdate::Qr(payload) => match qr::render_data_url(payload) {
            Ok(url) => vec![
                ControlEvent::Qr(url),
                ControlEvent::Log("QR Code received, please scan!".into()),
            ],
            Err(e) => {
                warn!(error = %e, "failed to render QR code");
                vec![ControlEvent::Log(format!("Failed to render QR code: {e}"))]
            },
        },
        StatusUpdate::Connected => status(ICON_CHECK, "WhatsApp connected!"),
        StatusUpdate::QrScanned => status(ICON_CHECK, "QR Code scanned!"),
        StatusUpdate::Loading => status(ICON_LOADER, "Registering QR Code, please wait!"),
    }
}

/// Holds the one live subscriber and the latest published phase.
#[derive(Default)]
pub struct StatusBroadcaster {
    slot: Mutex<Slot>,
    next_id: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `sender` the subscriber, replacing any previous one, and replay
    /// the current phase to it.
    pub async fn attach(&self, sender: mpsc::UnboundedSender<ControlEvent>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.subscriber.replace(Subscriber { id, sender }) {
            debug!(previous = previous.id, subscriber = id, "replacing control subscriber");
        }
        let current = slot.current();
        slot.deliver(&current);
        id
    }

    /// Remove the subscriber if it is still `id`. Returns whether it was.
    pub async fn detach(&self, id: SubscriberId) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.subscriber.as_ref().is_some_and(|s| s.id == id) {
            slot.subscriber = None;
            debug!(subscriber = id, "control subscriber detached");
            true
        } else {
            false
        }
    }

    /// Record `update` as the current phase and relay it if someone listens.
    pub async fn publish(&self, update: StatusUpdate) {
        let mut slot = self.slot.lock().await;
        slot.track(&update);
        slot.deliver(&update);
    }

    pub async fn has_subscriber(&self) -> bool {
        self.slot.lock().await.subscriber.is_some()
    }

    /// Phase a newly attached subscriber would be shown.
    pub async fn current(&self) -> StatusUpdate {
        self.slot.lock().await.current()
    }
}
