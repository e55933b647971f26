use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use pullwire_protocol::envelope::Envelope;
use pullwire_protocol::messages::RegisteredPayload;
use pullwire_transfer::{Assembler, TransferSession};
use tokio::sync::{Mutex, MutexGuard};

use crate::connection::ConnectionHandle;

/// The download currently running on a connection.
pub struct ActiveDownload {
    pub session: Arc<TransferSession>,
    /// Opened on the first chunk.
    pub assembler: Option<Assembler>,
}

/// A registered agent.
pub struct RegistryEntry {
    client_id: String,
    handle: ConnectionHandle,
    registered_at: DateTime<Utc>,
    order: u64,
    download: Mutex<Option<ActiveDownload>>,
}

impl RegistryEntry {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Locks the download slot. Holding the guard serializes every state
    /// change of this entry's session.
    pub async fn download(&self) -> MutexGuard<'_, Option<ActiveDownload>> {
        self.download.lock().await
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("client_id", &self.client_id)
            .field("handle", &self.handle)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

/// Maps client ids to their live connections.
///
/// Registering an id that is already present replaces the previous entry
/// (last write wins). Removal is keyed by connection, so a replaced
/// connection closing later never removes its successor.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_client: HashMap<String, Arc<RegistryEntry>>,
    by_conn: HashMap<u64, String>,
    next_order: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `client_id` and acknowledges with
    /// `registered`.
    ///
    /// Returns the entries this registration displaced: a different
    /// connection previously holding `client_id`, or an earlier id of the
    /// same connection.
    pub fn register(&self, handle: ConnectionHandle, client_id: &str) -> Vec<Arc<RegistryEntry>> {
        let mut displaced = Vec::new();
        {
            let mut inner = self.write();

            let already_current = inner
                .by_client
                .get(client_id)
                .is_some_and(|e| e.handle == handle);

            if !already_current {
                if let Some(previous_id) = inner.by_conn.remove(&handle.id()) {
                    if let Some(previous) = inner.by_client.remove(&previous_id) {
                        displaced.push(previous);
                    }
                }

                let order = inner.next_order;
                inner.next_order += 1;
                let entry = Arc::new(RegistryEntry {
                    client_id: client_id.to_string(),
                    handle: handle.clone(),
                    registered_at: Utc::now(),
                    order,
                    download: Mutex::new(None),
                });

                if let Some(old) = inner.by_client.insert(client_id.to_string(), entry) {
                    inner.by_conn.remove(&old.handle.id());
                    displaced.push(old);
                }
                inner.by_conn.insert(handle.id(), client_id.to_string());
            }
        }

        for old in &displaced {
            tracing::info!(
                client = %old.client_id,
                conn = old.handle.id(),
                "registry entry replaced"
            );
        }

        let ack = Envelope::Registered(RegisteredPayload {
            client_id: client_id.to_string(),
        });
        if handle.sender().send_envelope(&ack).is_err() {
            tracing::warn!(client = %client_id, conn = handle.id(), "could not acknowledge registration");
        }
        tracing::info!(client = %client_id, conn = handle.id(), peer = %handle.peer_addr(), "client registered");

        displaced
    }

    /// Returns the entry registered under `client_id`.
    pub fn lookup(&self, client_id: &str) -> Option<Arc<RegistryEntry>> {
        self.read().by_client.get(client_id).cloned()
    }

    /// Returns the entry registered over `handle`, if any.
    pub fn entry_for(&self, handle: &ConnectionHandle) -> Option<Arc<RegistryEntry>> {
        let inner = self.read();
        let client_id = inner.by_conn.get(&handle.id())?;
        inner
            .by_client
            .get(client_id)
            .filter(|e| e.handle == *handle)
            .cloned()
    }

    /// Removes the entry registered over `handle` and returns it.
    pub fn unregister(&self, handle: &ConnectionHandle) -> Option<Arc<RegistryEntry>> {
        let mut inner = self.write();
        let client_id = inner.by_conn.remove(&handle.id())?;
        let current = inner
            .by_client
            .get(&client_id)
            .is_some_and(|e| e.handle == *handle);
        if current {
            inner.by_client.remove(&client_id)
        } else {
            None
        }
    }

    /// All entries, oldest registration first.
    pub fn list(&self) -> Vec<Arc<RegistryEntry>> {
        let mut entries: Vec<_> = self.read().by_client.values().cloned().collect();
        entries.sort_by_key(|e| e.order);
        entries
    }

    pub fn len(&self) -> usize {
        self.read().by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
