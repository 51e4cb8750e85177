//! Storage backend for the in-process client.
//!
//! The device record (identity, noise and prekey material, account) is the
//! session's credentials: it is handed to the lifecycle core as a
//! [`NetworkEvent::CredsUpdate`] and comes back through [`Credentials`] on
//! the next connect. Everything else the protocol keeps (signal sessions,
//! prekeys, app-state keys, LID mappings) is written straight to keyspaces of
//! the [`SessionStore`], so it is wiped together with the credentials.

use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    serde::{Serialize, de::DeserializeOwned},
    sled::{IVec, Tree},
    tokio::sync::mpsc,
    tracing::{debug, warn},
    wacore::{
        appstate::{hash::HashState, processor::AppStateMutationMAC},
        store::{
            Device,
            device::DEVICE_PROPS,
            error::{Result, StoreError, db_err},
            traits::{
                AppStateSyncKey, AppSyncStore, DeviceListRecord, DeviceStore, LidPnMappingEntry,
                ProtocolStore, SignalStore,
            },
        },
    },
};

use crate::{
    client::NetworkEvent,
    store::{Credentials, ProtocolVersion, SessionStore},
};

/// Credentials for a device that has completed pairing. An unpaired device
/// only holds throwaway keys for the QR handshake and is never persisted.
pub(crate) fn device_credentials(device: &Device) -> Option<Credentials> {
    device.pn.as_ref()?;
    match postcard::to_allocvec(device) {
        Ok(blob) => Some(Credentials {
            version: ProtocolVersion([
                device.app_version_primary,
                device.app_version_secondary,
                device.app_version_tertiary,
            ]),
            blob,
        }),
        Err(e) => {
            warn!(error = %e, "failed to encode device record");
            None
        },
    }
}

/// Device record carried by `creds`, or `None` when the session is fresh or
/// the blob belongs to another client.
pub(crate) fn credentials_device(creds: &Credentials) -> Option<Device> {
    if creds.is_fresh() {
        return None;
    }
    match postcard::from_bytes::<Device>(&creds.blob) {
        Ok(mut device) => {
            device.device_props = DEVICE_PROPS.clone();
            Some(device)
        },
        Err(e) => {
            warn!(error = %e, "stored credentials are not a device record, pairing again");
            None
        },
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// `scope \0 rest`, for keyspaces indexed by two values.
fn pair_key(scope: &str, rest: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(scope.len() + 1 + rest.len());
    key.extend_from_slice(scope.as_bytes());
    key.push(0);
    key.extend_from_slice(rest);
    key
}

fn read(tree: &Tree, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
    Ok(tree.get(key).map_err(db_err)?.map(|v| v.to_vec()))
}

fn read_as<T: DeserializeOwned>(tree: &Tree, key: impl AsRef<[u8]>) -> Result<Option<T>> {
    tree.get(key)
        .map_err(db_err)?
        .map(|v| decode(&v))
        .transpose()
}

pub struct SledBackend {
    device: Mutex<Option<Device>>,
    /// Taken on retire so the connection's event stream can end.
    events: Mutex<Option<mpsc::UnboundedSender<NetworkEvent>>>,
    retired: AtomicBool,

    identities: Tree,
    sessions: Tree,
    prekeys: Tree,
    signed_prekeys: Tree,
    sender_keys: Tree,

    sync_keys: Tree,
    app_state_versions: Tree,
    mutation_macs: Tree,

    skdm_recipients: Tree,
    lid_mappings: Tree,
    pn_index: Tree,
    base_keys: Tree,
    device_lists: Tree,
    forget_marks: Tree,
}

impl SledBackend {
    /// Backend for one connection opened from `creds`. Device saves are
    /// reported on `events`.
    pub fn open(
        store: &SessionStore,
        creds: &Credentials,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            device: Mutex::new(credentials_device(creds)),
            events: Mutex::new(Some(events)),
            retired: AtomicBool::new(false),
            identities: store.keyspace("identities")?,
            sessions: store.keyspace("sessions")?,
            prekeys: store.keyspace("prekeys")?,
            signed_prekeys: store.keyspace("signed_prekeys")?,
            sender_keys: store.keyspace("sender_keys")?,
            sync_keys: store.keyspace("app_state_sync_keys")?,
            app_state_versions: store.keyspace("app_state_versions")?,
            mutation_macs: store.keyspace("app_state_mutation_macs")?,
            skdm_recipients: store.keyspace("skdm_recipients")?,
            lid_mappings: store.keyspace("lid_mappings")?,
            pn_index: store.keyspace("pn_to_lid")?,
            base_keys: store.keyspace("base_keys")?,
            device_lists: store.keyspace("device_lists")?,
            forget_marks: store.keyspace("sender_key_forget_marks")?,
        })
    }

    /// Stop writing. Called when the connection is torn down, so a client
    /// that is still winding down cannot repopulate a cleared session.
    pub fn retire(&self) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            lock(&self.events).take();
            debug!("session backend retired");
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn write(&self, tree: &Tree, key: impl AsRef<[u8]>, value: impl Into<IVec>) -> Result<()> {
        if self.is_retired() {
            return Ok(());
        }
        tree.insert(key, value).map_err(db_err)?;
        Ok(())
    }

    fn remove(&self, tree: &Tree, key: impl AsRef<[u8]>) -> Result<()> {
        if self.is_retired() {
            return Ok(());
        }
        tree.remove(key).map_err(db_err)?;
        Ok(())
    }

    /// Add `items` to the string set stored under `key`.
    fn extend_set(&self, tree: &Tree, key: &str, items: &[String]) -> Result<()> {
        let mut set: Vec<String> = read_as(tree, key)?.unwrap_or_default();
        for item in items {
            if !set.contains(item) {
                set.push(item.clone());
            }
        }
        self.write(tree, key, encode(&set)?)
    }
}

#[async_trait]
impl SignalStore for SledBackend {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        self.write(&self.identities, address, key.to_vec())
    }

    async fn load_identity(&self, address: &str) -> Result<Option<Vec<u8>>> {
        read(&self.identities, address)
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.remove(&self.identities, address)
    }

    async fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        read(&self.sessions, address)
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        self.write(&self.sessions, address, session)
    }

    async fn delete_session(&self, address: &str) -> Result<()> {
        self.remove(&self.sessions, address)
    }

    async fn store_prekey(&self, id: u32, record: &[u8], _uploaded: bool) -> Result<()> {
        self.write(&self.prekeys, id.to_be_bytes(), record)
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        read(&self.prekeys, id.to_be_bytes())
    }

    async fn remove_prekey(&self, id: u32) -> Result<()> {
        self.remove(&self.prekeys, id.to_be_bytes())
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> Result<()> {
        self.write(&self.signed_prekeys, id.to_be_bytes(), record)
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        read(&self.signed_prekeys, id.to_be_bytes())
    }

    async fn load_all_signed_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        self.signed_prekeys
            .iter()
            .map(|entry| {
                let (key, value) = entry.map_err(db_err)?;
                let id = <[u8; 4]>::try_from(key.as_ref())
                    .map_err(|_| StoreError::Serialization("malformed signed prekey id".into()))?;
                Ok((u32::from_be_bytes(id), value.to_vec()))
            })
            .collect()
    }

    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        self.remove(&self.signed_prekeys, id.to_be_bytes())
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> Result<()> {
        self.write(&self.sender_keys, address, record)
    }

    async fn get_sender_key(&self, address: &str) -> Result<Option<Vec<u8>>> {
        read(&self.sender_keys, address)
    }

    async fn delete_sender_key(&self, address: &str) -> Result<()> {
        self.remove(&self.sender_keys, address)
    }
}

#[async_trait]
impl AppSyncStore for SledBackend {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<AppStateSyncKey>> {
        read_as(&self.sync_keys, key_id)
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> Result<()> {
        self.write(&self.sync_keys, key_id, encode(&key)?)
    }

    async fn get_version(&self, name: &str) -> Result<HashState> {
        Ok(read_as(&self.app_state_versions, name)?.unwrap_or_default())
    }

    async fn set_version(&self, name: &str, state: HashState) -> Result<()> {
        self.write(&self.app_state_versions, name, encode(&state)?)
    }

    async fn put_mutation_macs(
        &self,
        name: &str,
        _version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> Result<()> {
        for mutation in mutations {
            self.write(
                &self.mutation_macs,
                pair_key(name, &mutation.index_mac),
                mutation.value_mac.as_slice(),
            )?;
        }
        Ok(())
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>> {
        read(&self.mutation_macs, pair_key(name, index_mac))
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()> {
        for index_mac in index_macs {
            self.remove(&self.mutation_macs, pair_key(name, index_mac))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolStore for SledBackend {
    async fn get_skdm_recipients(&self, group_jid: &str) -> Result<Vec<String>> {
        Ok(read_as(&self.skdm_recipients, group_jid)?.unwrap_or_default())
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[String]) -> Result<()> {
        if device_jids.is_empty() {
            return Ok(());
        }
        self.extend_set(&self.skdm_recipients, group_jid, device_jids)
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> Result<()> {
        self.remove(&self.skdm_recipients, group_jid)
    }

    async fn get_lid_mapping(&self, lid: &str) -> Result<Option<LidPnMappingEntry>> {
        read_as(&self.lid_mappings, lid)
    }

    async fn get_pn_mapping(&self, phone: &str) -> Result<Option<LidPnMappingEntry>> {
        let Some(lid) = read(&self.pn_index, phone)? else {
            return Ok(None);
        };
        let lid = String::from_utf8(lid).map_err(|e| StoreError::Serialization(e.to_string()))?;
        read_as(&self.lid_mappings, lid)
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> Result<()> {
        let mut entry = entry.clone();
        if let Some(existing) = read_as::<LidPnMappingEntry>(&self.lid_mappings, &entry.lid)? {
            entry.created_at = existing.created_at;
        }
        self.write(&self.lid_mappings, &entry.lid, encode(&entry)?)?;
        self.write(&self.pn_index, &entry.phone_number, entry.lid.as_bytes())
    }

    async fn get_all_lid_mappings(&self) -> Result<Vec<LidPnMappingEntry>> {
        self.lid_mappings
            .iter()
            .values()
            .map(|value| decode(&value.map_err(db_err)?))
            .collect()
    }

    async fn save_base_key(&self, address: &str, message_id: &str, base_key: &[u8]) -> Result<()> {
        self.write(
            &self.base_keys,
            pair_key(address, message_id.as_bytes()),
            base_key,
        )
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> Result<bool> {
        let stored = read(&self.base_keys, pair_key(address, message_id.as_bytes()))?;
        Ok(stored.as_deref() == Some(current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> Result<()> {
        self.remove(&self.base_keys, pair_key(address, message_id.as_bytes()))
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> Result<()> {
        self.write(&self.device_lists, &record.user, encode(&record)?)
    }

    async fn get_devices(&self, user: &str) -> Result<Option<DeviceListRecord>> {
        read_as(&self.device_lists, user)
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> Result<()> {
        self.extend_set(&self.forget_marks, group_jid, &[participant.to_string()])
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> Result<Vec<String>> {
        let marks = read_as(&self.forget_marks, group_jid)?.unwrap_or_default();
        self.remove(&self.forget_marks, group_jid)?;
        Ok(marks)
    }
}

#[async_trait]
impl DeviceStore for SledBackend {
    async fn save(&self, device: &Device) -> Result<()> {
        if self.is_retired() {
            return Ok(());
        }
        *lock(&self.device) = Some(device.clone());
        if let Some(creds) = device_credentials(device)
            && let Some(events) = lock(&self.events).as_ref()
        {
            // The receiver is gone once the connection is superseded.
            let _ = events.send(NetworkEvent::CredsUpdate(creds));
        }
        Ok(())
    }

    async fn load(&self) -> Result<Option<Device>> {
        Ok(lock(&self.device).clone())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(lock(&self.device).is_some())
    }

    /// A fresh device is generated in memory by the client; nothing to
    /// allocate until it pairs.
    async fn create(&self) -> Result<i32> {
        Ok(1)
    }
}
