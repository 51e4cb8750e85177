//! Credential persistence.
//!
//! The snapshot lives under a single key in a `sled` database. An insert
//! followed by `flush` replaces the whole snapshot at once, so a crash between
//! two saves leaves the previous snapshot readable.
//!
//! Network clients that keep more state than fits a snapshot (signal
//! sessions, prekeys, app-state keys) get named keyspaces in the same
//! database. Clearing the session empties those too.

use std::{fmt, path::Path};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::error::StoreError;

const CREDS_KEY: &[u8] = b"creds";
const KEYSPACE_PREFIX: &str = "keys/";

/// Protocol version the credentials were negotiated under, e.g. `2.3000.1015`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProtocolVersion(pub [u32; 3]);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.0;
        write!(f, "{major}.{minor}.{patch}")
    }
}

/// Session credentials. The blob is owned by the network client and never
/// interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub version: ProtocolVersion,
    pub blob: Vec<u8>,
}

impl Credentials {
    /// No key material yet: the next connection has to pair.
    pub fn is_fresh(&self) -> bool {
        self.blob.is_empty()
    }
}

/// Durable store for the single session snapshot.
pub struct SessionStore {
    db: sled::Db,
}

impl SessionStore {
    /// Open (or create) the store in `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let db = sled::open(dir)?;
        debug!(path = %dir.display(), "opened session store");
        Ok(Self { db })
    }

    /// In-memory store that disappears on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Stored credentials, or a fresh set when nothing usable is stored.
    pub fn load(&self) -> Credentials {
        match self.db.get(CREDS_KEY) {
            Ok(Some(bytes)) => match postcard::from_bytes(&bytes) {
                Ok(creds) => creds,
                Err(e) => {
                    warn!(error = %e, "stored session is unreadable, starting fresh");
                    Credentials::default()
                },
            },
            Ok(None) => {
                debug!("no stored session, starting fresh");
                Credentials::default()
            },
            Err(e) => {
                warn!(error = %e, "failed to read session store, starting fresh");
                Credentials::default()
            },
        }
    }

    /// Replace the stored snapshot.
    ///
    /// The version tag never moves backwards: if `creds` carries an older tag
    /// than the stored one, the stored tag is kept.
    pub fn save(&self, creds: &Credentials) -> Result<(), StoreError> {
        let bytes = match self.stored_version() {
            Some(stored) if stored > creds.version => {
                debug!(%stored, incoming = %creds.version, "keeping newer protocol version");
                postcard::to_allocvec(&Credentials {
                    version: stored,
                    blob: creds.blob.clone(),
                })?
            },
            _ => postcard::to_allocvec(creds)?,
        };
        self.db.insert(CREDS_KEY, bytes)?;
        self.db.flush()?;
        debug!(version = %creds.version, "saved session credentials");
        Ok(())
    }

    /// Drop the stored snapshot and every keyspace so the next start pairs
    /// from scratch.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.remove(CREDS_KEY)?;
        for name in self.db.tree_names() {
            if name.starts_with(KEYSPACE_PREFIX.as_bytes()) {
                self.db.open_tree(&name)?.clear()?;
            }
        }
        self.db.flush()?;
        debug!("cleared session credentials");
        Ok(())
    }

    /// Named keyspace that lives and dies with the session.
    pub fn keyspace(&self, name: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(format!("{KEYSPACE_PREFIX}{name}"))?)
    }

    pub fn has_session(&self) -> bool {
        !self.load().is_fresh()
    }

    fn stored_version(&self) -> Option<ProtocolVersion> {
        let bytes = self.db.get(CREDS_KEY).ok()??;
        postcard::from_bytes::<Credentials>(&bytes)
            .ok()
            .map(|c| c.version)
    }
}
