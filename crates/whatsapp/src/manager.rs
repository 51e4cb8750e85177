//! Connection lifecycle: open from stored credentials, pair, classify
//! disconnects, reconnect.
//!
//! One [`ConnectionManager`] exists per process and owns the only connection
//! to the network. Phase and identity are published together through a
//! `watch` channel so readers always see a matching pair.
//!
//! Lifecycle mutations (start, restart, event handling) are serialized by an
//! internal async mutex. Sends never take it; they only read the snapshot
//! and the current client handle.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    rand::Rng,
    tokio::sync::{Mutex, RwLock, mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use wagate_config::{BackoffKind, ReconnectConfig};

use crate::{
    broadcast::{StatusBroadcaster, StatusUpdate},
    client::{Connection, ConnectionState, ConnectionUpdate, Connector, NetworkClient, NetworkEvent},
    disconnect::{DisconnectReason, RecoverableCause},
    error::SendError,
    store::{Credentials, SessionStore},
};

// ── Phase ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    AwaitingPairing { qr: String },
    Open,
    Closed(DisconnectReason),
}

impl ConnectionPhase {
    /// A connection exists or is being established.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingPairing { .. } | Self::Open
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingPairing { .. } => "awaiting_pairing",
            Self::Open => "open",
            Self::Closed(_) => "closed",
        }
    }
}

/// Phase and authenticated identity, always updated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub phase: ConnectionPhase,
    pub identity: Option<String>,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Open && self.identity.is_some()
    }
}

// ── Reconnect policy ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { max_delay: Duration },
}

/// Delay before retrying after a recoverable disconnect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub backoff: Backoff,
    /// Add up to 20% random delay on top.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            backoff: Backoff::Fixed,
            jitter: false,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        let backoff = match cfg.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max_delay: Duration::from_secs(cfg.max_delay_secs.max(cfg.delay_secs)),
            },
        };
        Self {
            delay: Duration::from_secs(cfg.delay_secs),
            backoff,
            jitter: cfg.jitter,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry following `failures` consecutive recoverable
    /// disconnects (0 for the first).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => self
                .delay
                .saturating_mul(2u32.saturating_pow(failures))
                .min(max_delay),
        };
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = base / 5;
        base + spread.mul_f64(rand::rng().random::<f64>())
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Lifecycle {
    /// Bumped for every connection attempt and every close; events tagged
    /// with an older generation belong to a retired connection.
    generation: u64,
    /// A QR was shown since the last open, so the next open completes pairing.
    pairing: bool,
    /// Consecutive recoverable disconnects, reset on open.
    failures: u32,
    retry: Option<CancellationToken>,
}

impl Lifecycle {
    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            debug!("cancelling pending reconnect");
            token.cancel();
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    store: Arc<SessionStore>,
    broadcaster: Arc<StatusBroadcaster>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionSnapshot>,
    client: RwLock<Option<Arc<dyn NetworkClient>>>,
    lifecycle: Mutex<Lifecycle>,
    retries_scheduled: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<SessionStore>,
        broadcaster: Arc<StatusBroadcaster>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionSnapshot {
            phase: ConnectionPhase::Idle,
            identity: None,
        });
        Arc::new(Self {
            connector,
            store,
            broadcaster,
            policy,
            state,
            client: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
            retries_scheduled: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Number of reconnects scheduled since startup, including cancelled ones.
    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    /// Open a connection from the stored credentials.
    ///
    /// No-op while a connection is connecting, awaiting pairing or open.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut life = self.lifecycle.lock().await;
        self.start_locked(&mut life).await
    }

    /// Drop the current connection (if any) and start a new one.
    ///
    /// Also the way out of a terminal disconnect: the operator restarts and
    /// scans a fresh QR code.
    pub async fn restart(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut life = self.lifecycle.lock().await;
        info!("restarting WhatsApp connection");
        life.cancel_retry();
        life.generation += 1;
        life.failures = 0;
        self.drop_client().await;
        self.set_phase(ConnectionPhase::Idle, None);
        self.start_locked(&mut life).await
    }

    /// Cancel any pending reconnect and close the connection.
    pub async fn shutdown(&self) {
        let mut life = self.lifecycle.lock().await;
        life.cancel_retry();
        life.generation += 1;
        self.drop_client().await;
        self.set_phase(ConnectionPhase::Idle, None);
        info!("WhatsApp connection shut down");
    }

    async fn start_locked(self: &Arc<Self>, life: &mut Lifecycle) -> anyhow::Result<()> {
        let phase = self.phase();
        if phase.is_active() {
            debug!(phase = phase.name(), "connection already in progress, ignoring start");
            return Ok(());
        }

        life.cancel_retry();
        life.generation += 1;
        let generation = life.generation;

        let creds = self.store.load();
        info!(
            fresh = creds.is_fresh(),
            version = %creds.version,
            generation,
            "opening WhatsApp connection"
        );
        self.broadcaster.publish(StatusUpdate::Loading).await;
        self.set_phase(ConnectionPhase::Connecting, None);

        match self.connector.connect(&creds).await {
            Ok(Connection { client, events }) => {
                *self.client.write().await = Some(client);
                self.spawn_event_loop(generation, events);
                Ok(())
            },
            Err(e) => {
                error!(error = %e, "failed to open WhatsApp connection");
                let reason = DisconnectReason::Recoverable(RecoverableCause::ConnectionClosed);
                self.handle_close(life, reason, None).await;
                Err(e)
            },
        }
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    NetworkEvent::Connection(update) => {
                        this.on_connection_update(generation, update).await
                    },
                    NetworkEvent::CredsUpdate(creds) => this.on_creds_update(generation, &creds).await,
                }
            }
            this.on_stream_end(generation).await;
        });
    }

    /// Apply one connection update from the connection of `generation`.
    pub(crate) async fn on_connection_update(
        self: &Arc<Self>,
        generation: u64,
        update: ConnectionUpdate,
    ) {
        let mut life = self.lifecycle.lock().await;
        if generation != life.generation {
            debug!(
                generation,
                current = life.generation,
                "ignoring event from superseded connection"
            );
            return;
        }

        if update.connection != Some(ConnectionState::Close) && !self.phase().is_active() {
            debug!(phase = self.phase().name(), "ignoring update outside an active connection");
            return;
        }

        match update.connection {
            Some(ConnectionState::Close) => {
                let last = update.last_disconnect.unwrap_or_default();
                let reason = DisconnectReason::from_status(last.status_code);
                self.handle_close(&mut life, reason, last.message.as_deref())
                    .await;
            },
            Some(ConnectionState::Open) => self.handle_open(&mut life, update.user).await,
            Some(ConnectionState::Connecting) | None => {
                if let Some(qr) = update.qr {
                    debug!("pairing QR code issued");
                    life.pairing = true;
                    self.broadcaster
                        .publish(StatusUpdate::Qr(qr.clone()))
                        .await;
                    self.set_phase(ConnectionPhase::AwaitingPairing { qr }, None);
                }
            },
        }
    }

    async fn on_creds_update(&self, generation: u64, creds: &Credentials) {
        let life = self.lifecycle.lock().await;
        if generation != life.generation || !self.phase().is_active() {
            debug!(generation, "ignoring credentials from retired connection");
            return;
        }
        if let Err(e) = self.store.save(creds) {
            error!(error = %e, "failed to persist session credentials");
        }
    }

    async fn on_stream_end(self: &Arc<Self>, generation: u64) {
        let mut life = self.lifecycle.lock().await;
        if generation != life.generation || !self.phase().is_active() {
            return;
        }
        warn!(generation, "event stream ended without a close event");
        let reason = DisconnectReason::Recoverable(RecoverableCause::ConnectionLost);
        self.handle_close(&mut life, reason, None).await;
    }

    async fn handle_open(self: &Arc<Self>, life: &mut Lifecycle, user: Option<String>) {
        life.failures = 0;
        match user.as_deref() {
            Some(user) => info!(user, "opened connection"),
            None => warn!("connection opened without an authenticated identity"),
        }

        if std::mem::take(&mut life.pairing) {
            self.broadcaster.publish(StatusUpdate::QrScanned).await;
        }
        self.broadcaster.publish(StatusUpdate::Connected).await;
        self.set_phase(ConnectionPhase::Open, user);
        self.log_groups().await;
    }

    async fn handle_close(
        self: &Arc<Self>,
        life: &mut Lifecycle,
        reason: DisconnectReason,
        detail: Option<&str>,
    ) {
        // Whatever the closed connection still emits is stale from here on.
        life.generation += 1;
        let client = self.client.write().await.take();
        warn!(%reason, detail = detail.unwrap_or(""), "{}", reason.hint());

        if reason.is_recoverable() {
            if let Some(client) = client {
                client.close().await;
            }
            self.broadcaster.publish(StatusUpdate::Loading).await;
            self.schedule_retry(life);
        } else {
            if let Some(client) = client {
                if let Err(e) = client.logout().await {
                    debug!(error = %e, "logout after terminal disconnect failed");
                }
                client.close().await;
            }
            if let Err(e) = self.store.clear() {
                error!(error = %e, "failed to clear session credentials");
            }
            life.pairing = false;
            life.failures = 0;
            self.broadcaster.publish(StatusUpdate::Loading).await;
        }

        self.set_phase(ConnectionPhase::Closed(reason), None);
    }

    fn schedule_retry(self: &Arc<Self>, life: &mut Lifecycle) {
        life.cancel_retry();
        let delay = self.policy.delay_for(life.failures);
        life.failures = life.failures.saturating_add(1);

        let token = CancellationToken::new();
        life.retry = Some(token.clone());
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {},
                () = tokio::time::sleep(delay) => {
                    if let Err(e) = this.start().await {
                        warn!(error = %e, "reconnect attempt failed");
                    }
                },
            }
        });
    }

    /// Best-effort listing of joined groups; never affects the connection.
    async fn log_groups(&self) {
        let Some(client) = self.client.read().await.clone() else {
            return;
        };
        tokio::spawn(async move {
            match client.participating_groups().await {
                Ok(groups) => {
                    for group in groups {
                        info!(group_id = %group.id, subject = %group.subject, "participating group");
                    }
                },
                Err(e) => debug!(error = %e, "failed to list groups"),
            }
        });
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Send `text` to a user after confirming the address is registered.
    pub async fn send_direct(&self, recipient: &str, text: &str) -> Result<(), SendError> {
        let client = self.connected_client().await?;
        let jid = client
            .lookup(recipient)
            .await
            .map_err(SendError::failure)?
            .ok_or_else(|| SendError::NotRegistered(recipient.to_string()))?;
        client
            .send_text(&jid, text)
            .await
            .map_err(SendError::failure)?;
        debug!(to = %jid, "message sent");
        Ok(())
    }

    /// Send `text` to a group addressed by its opaque id. No lookup.
    pub async fn send_to_group(&self, group_id: &str, text: &str) -> Result<(), SendError> {
        let client = self.connected_client().await?;
        client
            .send_text(group_id, text)
            .await
            .map_err(SendError::failure)?;
        debug!(to = %group_id, "group message sent");
        Ok(())
    }

    async fn connected_client(&self) -> Result<Arc<dyn NetworkClient>, SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        self.client
            .read()
            .await
            .clone()
            .ok_or(SendError::NotConnected)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn phase(&self) -> ConnectionPhase {
        self.state.borrow().phase.clone()
    }

    fn set_phase(&self, phase: ConnectionPhase, identity: Option<String>) {
        debug!(phase = phase.name(), "phase transition");
        self.state.send_replace(ConnectionSnapshot { phase, identity });
    }

    async fn drop_client(&self) {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            broadcast::{ControlEvent, ICON_CHECK},
            disconnect::status,
            qr,
            store::ProtocolVersion,
            testing::FakeConnector,
        },
        tokio::time::Instant,
    };

    struct Harness {
        manager: Arc<ConnectionManager>,
        connector: Arc<FakeConnector>,
        store: Arc<SessionStore>,
        broadcaster: Arc<StatusBroadcaster>,
        phases: watch::Receiver<ConnectionSnapshot>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_policy(ReconnectPolicy::default())
        }

        fn with_policy(policy: ReconnectPolicy) -> Self {
            let connector = FakeConnector::new();
            let dyn_connector: Arc<dyn Connector> = connector.clone();
            let store = Arc::new(SessionStore::temporary().unwrap());
            let broadcaster = Arc::new(StatusBroadcaster::new());
            let manager = ConnectionManager::new(
                dyn_connector,
                Arc::clone(&store),
                Arc::clone(&broadcaster),
                policy,
            );
            let phases = manager.subscribe();
            Self {
                manager,
                connector,
                store,
                broadcaster,
                phases,
            }
        }

        async fn wait(&mut self, pred: impl FnMut(&ConnectionSnapshot) -> bool) {
            self.phases.wait_for(pred).await.map(|_| ()).unwrap();
        }

        async fn open(&mut self) {
            self.manager.start().await.unwrap();
            self.connector
                .emit(ConnectionUpdate::opened("6281111@s.whatsapp.net"));
            self.wait(|s| s.is_connected()).await;
        }
    }

    fn closed(s: &ConnectionSnapshot) -> bool {
        matches!(s.phase, ConnectionPhase::Closed(_))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let mut h = Harness::new();
        h.manager.start().await.unwrap();
        h.manager.start().await.unwrap();
        assert_eq!(h.connector.connects(), 1);
        assert_eq!(h.manager.snapshot().phase, ConnectionPhase::Connecting);

        h.connector.emit(ConnectionUpdate::qr("ref-1"));
        h.wait(|s| matches!(s.phase, ConnectionPhase::AwaitingPairing { .. }))
            .await;
        h.manager.start().await.unwrap();

        h.connector.emit(ConnectionUpdate::opened("628@s.whatsapp.net"));
        h.wait(ConnectionSnapshot::is_connected).await;
        h.manager.start().await.unwrap();

        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn qr_regeneration_supersedes_previous_payload() {
        let mut h = Harness::new();
        h.manager.start().await.unwrap();
        h.connector.emit(ConnectionUpdate::qr("ref-1"));
        h.connector.emit(ConnectionUpdate::qr("ref-2"));
        h.wait(|s| s.phase == ConnectionPhase::AwaitingPairing { qr: "ref-2".into() })
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.broadcaster.attach(tx).await;
        assert_eq!(
            rx.recv().await,
            Some(ControlEvent::Qr(qr::render_data_url("ref-2").unwrap()))
        );
    }

    #[tokio::test]
    async fn pairing_publishes_scanned_then_connected() {
        let mut h = Harness::new();
        h.manager.start().await.unwrap();
        h.connector.emit(ConnectionUpdate::qr("ref-1"));
        h.wait(|s| matches!(s.phase, ConnectionPhase::AwaitingPairing { .. }))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.broadcaster.attach(tx).await;
        // Replay of the held QR.
        assert!(matches!(rx.recv().await, Some(ControlEvent::Qr(_))));
        assert!(matches!(rx.recv().await, Some(ControlEvent::Log(_))));

        h.connector.emit(ConnectionUpdate::opened("628@s.whatsapp.net"));
        h.wait(ConnectionSnapshot::is_connected).await;

        let mut logs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ControlEvent::Log(line) = event {
                logs.push(line);
            }
        }
        assert_eq!(logs, vec!["QR Code scanned!", "WhatsApp connected!"]);
    }

    #[tokio::test]
    async fn attach_while_open_yields_connected_only() {
        let mut h = Harness::new();
        h.open().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.broadcaster.attach(tx).await;
        assert_eq!(rx.recv().await, Some(ControlEvent::QrStatus(ICON_CHECK.into())));
        assert_eq!(
            rx.recv().await,
            Some(ControlEvent::Log("WhatsApp connected!".into()))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_close_retries_once_after_delay() {
        for code in [
            status::CONNECTION_CLOSED,
            status::TIMED_OUT,
            status::RESTART_REQUIRED,
        ] {
            let mut h = Harness::new();
            h.open().await;

            let closed_at = Instant::now();
            h.connector.emit(ConnectionUpdate::closed(Some(code)));
            h.wait(closed).await;
            assert!(!h.manager.is_connected());
            assert_eq!(h.manager.snapshot().phase.name(), "closed");

            h.wait(|s| s.phase == ConnectionPhase::Connecting).await;
            assert!(closed_at.elapsed() >= Duration::from_secs(5), "code {code}");
            assert_eq!(h.connector.connects(), 2);
            assert_eq!(h.manager.retries_scheduled(), 1);

            tokio::time::sleep(Duration::from_secs(60)).await;
            assert_eq!(h.connector.connects(), 2, "code {code}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_event_stream_is_recoverable() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.drop_stream();
        h.wait(|s| {
            s.phase
                == ConnectionPhase::Closed(DisconnectReason::Recoverable(
                    RecoverableCause::ConnectionLost,
                ))
        })
        .await;
        h.wait(|s| s.phase == ConnectionPhase::Connecting).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_close_keeps_a_single_timer() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.emit(ConnectionUpdate::closed(Some(status::CONNECTION_CLOSED)));
        h.connector.emit(ConnectionUpdate::closed(Some(status::CONNECTION_CLOSED)));
        h.wait(|s| s.phase == ConnectionPhase::Connecting).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.connects(), 2);
        // The first close retires the connection; the second is ignored.
        assert_eq!(h.manager.retries_scheduled(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_after_terminal_close_are_not_persisted() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.emit(ConnectionUpdate::closed(Some(status::LOGGED_OUT)));
        h.wait(closed).await;
        assert!(!h.store.has_session());

        h.connector.emit_creds(Credentials {
            version: ProtocolVersion([2, 3000, 1]),
            blob: b"late-keys".to_vec(),
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!h.store.has_session());

        h.manager.restart().await.unwrap();
        assert!(h.connector.opened_with().last().unwrap().is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn late_qr_after_recoverable_close_does_not_block_retry() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.emit(ConnectionUpdate::closed(Some(status::CONNECTION_CLOSED)));
        h.connector.emit(ConnectionUpdate::qr("stale-qr"));
        h.wait(closed).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.connects(), 2);
        assert_eq!(h.manager.snapshot().phase, ConnectionPhase::Connecting);

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.broadcaster.attach(tx).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ControlEvent::Qr(_)), "stale QR replayed");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_open_after_close_is_ignored() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.emit(ConnectionUpdate::closed(Some(status::CONNECTION_CLOSED)));
        h.connector.emit(ConnectionUpdate::opened("628@s.whatsapp.net"));
        h.wait(closed).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn group_listing_on_open_is_logged_only() {
        let mut h = Harness::new();
        let client = Arc::clone(h.connector.client());
        client.add_group("120363-1@g.us", "Ops");
        client.add_group("120363-2@g.us", "Sales");
        h.open().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.group_listings(), 1);
        assert_eq!(h.manager.snapshot().phase, ConnectionPhase::Open);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_group_listing_keeps_connection_open() {
        let mut h = Harness::new();
        let client = Arc::clone(h.connector.client());
        client.fail_groups(true);
        h.open().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.group_listings(), 1);
        assert_eq!(h.manager.snapshot().phase, ConnectionPhase::Open);
        assert!(h.manager.is_connected());
        h.manager.send_to_group("120363-1@g.us", "still up").await.unwrap();
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_close_never_retries() {
        for (code, reason) in [
            (Some(status::BAD_SESSION), DisconnectReason::BadSession),
            (Some(status::LOGGED_OUT), DisconnectReason::LoggedOut),
            (Some(status::CONNECTION_REPLACED), DisconnectReason::Replaced),
            (Some(411), DisconnectReason::Unknown(Some(411))),
            (None, DisconnectReason::Unknown(None)),
        ] {
            let mut h = Harness::new();
            h.manager.start().await.unwrap();
            h.connector.emit_creds(Credentials {
                version: ProtocolVersion([2, 3000, 1]),
                blob: b"keys".to_vec(),
            });
            h.connector.emit(ConnectionUpdate::opened("628@s.whatsapp.net"));
            h.wait(ConnectionSnapshot::is_connected).await;
            assert!(h.store.has_session());

            h.connector.emit(ConnectionUpdate::closed(code));
            h.wait(closed).await;
            assert_eq!(h.manager.snapshot().phase, ConnectionPhase::Closed(reason));

            tokio::time::sleep(Duration::from_secs(60)).await;
            assert_eq!(h.connector.connects(), 1, "{reason}");
            assert_eq!(h.manager.retries_scheduled(), 0);
            assert!(!h.manager.is_connected());
            assert!(!h.store.has_session(), "{reason} must clear credentials");
            assert_eq!(h.connector.client().logouts(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_is_retried() {
        let mut h = Harness::new();
        h.connector.fail_next_connect();
        assert!(h.manager.start().await.is_err());
        assert_eq!(
            h.manager.snapshot().phase,
            ConnectionPhase::Closed(DisconnectReason::Recoverable(
                RecoverableCause::ConnectionClosed
            ))
        );

        h.wait(|s| s.phase == ConnectionPhase::Connecting).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_terminal_close_pairs_fresh() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.emit(ConnectionUpdate::closed(Some(status::LOGGED_OUT)));
        h.wait(closed).await;

        h.manager.restart().await.unwrap();
        assert_eq!(h.connector.connects(), 2);
        assert_eq!(h.manager.snapshot().phase, ConnectionPhase::Connecting);
        assert!(h.connector.opened_with().last().unwrap().is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cancels_pending_retry() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.emit(ConnectionUpdate::closed(Some(status::CONNECTION_CLOSED)));
        h.wait(closed).await;

        h.manager.restart().await.unwrap();
        assert_eq!(h.connector.connects(), 2);

        // Close the new connection terminally; a surviving timer would now
        // show up as a third connect.
        h.connector.emit(ConnectionUpdate::closed(Some(status::LOGGED_OUT)));
        h.wait(closed).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test]
    async fn credential_updates_are_persisted_and_reused() {
        let mut h = Harness::new();
        h.manager.start().await.unwrap();
        let creds = Credentials {
            version: ProtocolVersion([2, 3000, 7]),
            blob: b"rotated".to_vec(),
        };
        h.connector.emit_creds(creds.clone());
        h.connector.emit(ConnectionUpdate::opened("628@s.whatsapp.net"));
        h.wait(ConnectionSnapshot::is_connected).await;
        assert_eq!(h.store.load(), creds);

        h.manager.restart().await.unwrap();
        assert_eq!(h.connector.opened_with().last(), Some(&creds));
    }

    #[tokio::test]
    async fn open_without_identity_is_not_connected() {
        let mut h = Harness::new();
        h.manager.start().await.unwrap();
        h.connector.emit(ConnectionUpdate {
            connection: Some(ConnectionState::Open),
            ..ConnectionUpdate::default()
        });
        h.wait(|s| s.phase == ConnectionPhase::Open).await;
        assert!(!h.manager.is_connected());
    }

    #[tokio::test]
    async fn send_direct_requires_open_connection() {
        let h = Harness::new();
        let err = h.manager.send_direct("628@s.whatsapp.net", "hi").await;
        assert!(matches!(err, Err(SendError::NotConnected)));

        h.manager.start().await.unwrap();
        let err = h.manager.send_direct("628@s.whatsapp.net", "hi").await;
        assert!(matches!(err, Err(SendError::NotConnected)));
        assert_eq!(h.connector.client().lookups(), 0);
    }

    #[tokio::test]
    async fn send_direct_resolves_then_sends() {
        let mut h = Harness::new();
        h.open().await;
        let client = h.connector.client();
        client.register("6281234567890@s.whatsapp.net");

        h.manager
            .send_direct("6281234567890@s.whatsapp.net", "hi")
            .await
            .unwrap();
        assert_eq!(client.sent(), vec![(
            "6281234567890@s.whatsapp.net".to_string(),
            "hi".to_string()
        )]);

        let err = h.manager.send_direct("62899@s.whatsapp.net", "hi").await;
        assert!(matches!(err, Err(SendError::NotRegistered(ref r)) if r == "62899@s.whatsapp.net"));

        client.fail_sends(true);
        let err = h
            .manager
            .send_direct("6281234567890@s.whatsapp.net", "hi")
            .await;
        assert!(matches!(err, Err(SendError::SendFailure(ref m)) if m.contains("socket closed")));
    }

    #[tokio::test]
    async fn send_to_group_skips_lookup() {
        let mut h = Harness::new();
        h.open().await;
        h.manager.send_to_group("123-456@g.us", "hello").await.unwrap();
        let client = h.connector.client();
        assert_eq!(client.lookups(), 0);
        assert_eq!(client.sent(), vec![(
            "123-456@g.us".to_string(),
            "hello".to_string()
        )]);
    }

    #[tokio::test]
    async fn shutdown_closes_client() {
        let mut h = Harness::new();
        h.open().await;
        h.manager.shutdown().await;
        assert_eq!(h.manager.snapshot().phase, ConnectionPhase::Idle);
        assert_eq!(h.connector.client().closes(), 1);
        assert!(matches!(
            h.manager.send_to_group("1@g.us", "x").await,
            Err(SendError::NotConnected)
        ));
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(7), Duration::from_secs(5));
    }

    #[test]
    fn exponential_policy_is_bounded() {
        let policy = ReconnectPolicy::from(&ReconnectConfig {
            delay_secs: 5,
            backoff: BackoffKind::Exponential,
            max_delay_secs: 60,
            jitter: false,
        });
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_a_fifth() {
        let policy = ReconnectPolicy {
            jitter: true,
            ..ReconnectPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(6));
        }
    }
}
