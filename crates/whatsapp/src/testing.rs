//! In-memory [`Connector`] for driving the lifecycle without a network client.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    tokio::sync::mpsc,
};

use crate::{
    client::{Connection, ConnectionUpdate, Connector, GroupInfo, NetworkClient, NetworkEvent},
    store::Credentials,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every call; registration is whatever was passed to `register`.
#[derive(Default)]
pub struct FakeClient {
    registered: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, String)>>,
    groups: Mutex<Vec<GroupInfo>>,
    lookups: AtomicUsize,
    group_listings: AtomicUsize,
    logouts: AtomicUsize,
    closes: AtomicUsize,
    fail_sends: AtomicBool,
    fail_groups: AtomicBool,
}

impl FakeClient {
    pub fn register(&self, jid: &str) {
        lock(&self.registered).insert(jid.to_string());
    }

    pub fn add_group(&self, id: &str, subject: &str) {
        lock(&self.groups).push(GroupInfo {
            id: id.into(),
            subject: subject.into(),
        });
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_groups(&self, fail: bool) {
        self.fail_groups.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn group_listings(&self) -> usize {
        self.group_listings.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkClient for FakeClient {
    async fn lookup(&self, jid: &str) -> Result<Option<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.registered).get(jid).cloned())
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("socket closed");
        }
        lock(&self.sent).push((jid.to_string(), text.to_string()));
        Ok(())
    }

    async fn participating_groups(&self) -> Result<Vec<GroupInfo>> {
        self.group_listings.fetch_add(1, Ordering::SeqCst);
        if self.fail_groups.load(Ordering::SeqCst) {
            bail!("group query timed out");
        }
        Ok(lock(&self.groups).clone())
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one shared [`FakeClient`]; the test pushes events into the most
/// recent connection.
#[derive(Default)]
pub struct FakeConnector {
    client: Arc<FakeClient>,
    connects: AtomicUsize,
    fail_next: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<NetworkEvent>>>,
    opened_with: Mutex<Vec<Credentials>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(&self) -> &Arc<FakeClient> {
        &self.client
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next `connect` fail.
    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Credentials each connection was opened with, oldest first.
    pub fn opened_with(&self) -> Vec<Credentials> {
        lock(&self.opened_with).clone()
    }

    pub fn emit(&self, update: ConnectionUpdate) -> bool {
        self.send(NetworkEvent::Connection(update))
    }

    pub fn emit_creds(&self, creds: Credentials) -> bool {
        self.send(NetworkEvent::CredsUpdate(creds))
    }

    /// End the current event stream, as if the client died.
    pub fn drop_stream(&self) {
        lock(&self.events).take();
    }

    fn send(&self, event: NetworkEvent) -> bool {
        lock(&self.events)
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, creds: &Credentials) -> Result<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.opened_with).push(creds.clone());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("network unavailable");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(tx);
        Ok(Connection {
            client: self.client.clone(),
            events: rx,
        })
    }
}
