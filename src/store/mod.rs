//! Persistent store for identity material, pre-keys, sessions, sender-keys,
//! and LID/PN mapping. Every category lives behind a narrow trait so the
//! concrete storage backend (in-memory here; sqlite/postgres are out of
//! scope) can be swapped without touching the crypto modules.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::StoreError;
use crate::keys::KeyPair;

/// Hard ceiling applied to every indexed collection (§4.B "Size enforcement").
pub const INDEX_CEILING: usize = 1000;
/// Ceiling specifically for the LID↔PN mapping (§3).
pub const LID_MAPPING_CEILING: usize = 500;
/// Pre-keys generated in one batch when the local store is found empty at
/// startup (§4.B "Integrity validation on startup").
pub const INTEGRITY_BATCH_SIZE: u32 = 95;
/// Retry budget for a keyed transaction that hits a transient failure.
const TRANSACTION_RETRY_BUDGET: u32 = 3;

/// A signed pre-key: the key-pair, its id, and the identity-key signature
/// over its public half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
    pub signature: [u8; 64],
}

/// One past or current sender-key chain state for a group sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyState {
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
    pub signing_key: KeyPair,
    /// Skipped-iteration message keys, bounded per state.
    pub skipped_keys: HashMap<u32, [u8; 32]>,
}

/// Up to N past states for a `(group, sender)` pair; newest last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderKeyRecord {
    pub states: Vec<SenderKeyState>,
}

/// Opaque serialized 1:1 ratchet state, keyed by protocol address
/// (`"{user}[_{domain_type}].{device}"`).
pub type SessionBlob = Vec<u8>;

/// Access to the process-scoped identity credential bundle.
#[async_trait]
pub trait CredsStore: Send + Sync {
    async fn load_creds(&self) -> Result<Option<Vec<u8>>, StoreError>;
    async fn store_creds(&self, blob: Vec<u8>) -> Result<(), StoreError>;
}

/// Access to one-time pre-keys.
#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_pre_key(&self, key_id: u32) -> Result<Option<KeyPair>, StoreError>;
    async fn store_pre_key(&self, key_id: u32, key: KeyPair) -> Result<(), StoreError>;
    async fn delete_pre_key(&self, key_id: u32) -> Result<(), StoreError>;
    /// Highest pre-key id ever stored, used both as the upload cursor and
    /// by the startup integrity check (`next_pre_key_id - 1`).
    async fn highest_pre_key_id(&self) -> Result<Option<u32>, StoreError>;
}

/// Access to the single current signed pre-key.
#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    async fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError>;
    async fn store_signed_pre_key(&self, record: SignedPreKeyRecord) -> Result<(), StoreError>;
}

/// Access to per-address 1:1 ratchet state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, address: &str) -> Result<Option<SessionBlob>, StoreError>;
    async fn store_session(&self, address: &str, blob: SessionBlob) -> Result<(), StoreError>;
    async fn delete_session(&self, address: &str) -> Result<(), StoreError>;
    /// Snapshot of every address currently recorded (the `session._index`
    /// collection required by the startup integrity check).
    async fn session_index(&self) -> Result<Vec<String>, StoreError>;
}

/// Access to per-`(group, sender)` sender-key chain state.
#[async_trait]
pub trait SenderKeyStore: Send + Sync {
    async fn load_sender_key(&self, group_jid: &str, sender_address: &str) -> Result<Option<SenderKeyRecord>, StoreError>;
    async fn store_sender_key(&self, group_jid: &str, sender_address: &str, record: SenderKeyRecord) -> Result<(), StoreError>;
}

/// Tracks which devices have already received the current group's SKDM,
/// keyed by `(group, epoch)` so a sender-key rotation (a new `epoch`, in
/// practice the new chain's key-id) naturally requires re-distribution
/// without needing a separate cache-eviction pass. Per the recorded Open
/// Question 2 resolution, this is the sole (batched `_index`)
/// representation — no flat per-group keyed map.
#[async_trait]
pub trait SenderKeyMemoryStore: Send + Sync {
    async fn has_received(&self, group_jid: &str, epoch: &str, device_jid: &str) -> Result<bool, StoreError>;
    async fn mark_received(&self, group_jid: &str, epoch: &str, device_jid: &str) -> Result<(), StoreError>;
    /// Drops every recorded epoch for a group, e.g. when the group itself
    /// is torn down.
    async fn reset_group(&self, group_jid: &str) -> Result<(), StoreError>;
}

/// Per-user device list, persisted as a single indexed table.
#[async_trait]
pub trait DeviceListStore: Send + Sync {
    async fn load_devices(&self, user: &str) -> Result<Option<Vec<u32>>, StoreError>;
    async fn store_devices(&self, user: &str, devices: Vec<u32>) -> Result<(), StoreError>;
}

/// Write-once LID↔PN bijection with an LRU ceiling.
#[async_trait]
pub trait LidMappingStore: Send + Sync {
    async fn lid_for_pn(&self, pn_user: &str) -> Result<Option<String>, StoreError>;
    async fn pn_for_lid(&self, lid_user: &str) -> Result<Option<String>, StoreError>;
    /// Rejects (returns `Ok(false)`, logs) a write that would overwrite an
    /// existing mapping for `pn_user` with a different LID.
    async fn insert_mapping(&self, pn_user: &str, lid_user: &str) -> Result<bool, StoreError>;
}

/// App-state (contacts/chat metadata sync) key material.
#[async_trait]
pub trait AppStateSyncKeyStore: Send + Sync {
    async fn load_app_state_key(&self, key_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn store_app_state_key(&self, key_id: &str, key: Vec<u8>) -> Result<(), StoreError>;
}

/// Composed store capability required by every other component.
pub trait SignalStore:
    CredsStore
    + PreKeyStore
    + SignedPreKeyStore
    + SessionStore
    + SenderKeyStore
    + SenderKeyMemoryStore
    + DeviceListStore
    + LidMappingStore
    + AppStateSyncKeyStore
{
}

impl<T> SignalStore for T where
    T: CredsStore
        + PreKeyStore
        + SignedPreKeyStore
        + SessionStore
        + SenderKeyStore
        + SenderKeyMemoryStore
        + DeviceListStore
        + LidMappingStore
        + AppStateSyncKeyStore
{
}

/// Per-key lock registry backing [`InMemorySignalStore::transaction`]. Keyed
/// transactions serialize concurrent writers to the same logical key
/// (e.g. one recipient JID, or the caller's own id for the relay) without
/// blocking unrelated keys.
#[derive(Default)]
struct KeyLocks {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(key.to_owned()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

/// Reference in-memory implementation of [`SignalStore`]. Not durable;
/// intended for tests and as the template for a real backend.
#[derive(Default)]
pub struct InMemorySignalStore {
    creds: DashMap<(), Vec<u8>>,
    pre_keys: DashMap<u32, KeyPair>,
    signed_pre_keys: DashMap<u32, SignedPreKeyRecord>,
    sessions: DashMap<String, SessionBlob>,
    sender_keys: DashMap<(String, String), SenderKeyRecord>,
    sender_key_memory: DashMap<String, IndexMap<String, BTreeSet<String>>>,
    device_lists: DashMap<String, Vec<u32>>,
    pn_to_lid: DashMap<String, String>,
    lid_to_pn: DashMap<String, String>,
    app_state_keys: DashMap<String, Vec<u8>>,
    locks: KeyLocks,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` under the lock for `key`, retrying up to
    /// [`TRANSACTION_RETRY_BUDGET`] times if it returns
    /// [`StoreError::Poisoned`] (the only error this implementation treats
    /// as transient).
    pub async fn transaction<F, Fut, T>(&self, key: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let lock = self.locks.lock_for(key);
        let _guard = lock.lock().await;

        let mut attempts = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Poisoned(_)) if attempts < TRANSACTION_RETRY_BUDGET => {
                    attempts += 1;
                    tracing::warn!(key, attempts, "retrying transaction after transient failure");
                }
                Err(_) => return Err(StoreError::TransactionRetriesExhausted(key.to_owned())),
            }
        }
    }

    /// Trims an indexed collection to [`INDEX_CEILING`] (or a caller-given
    /// ceiling), keeping the lexicographically greatest keys, per §4.B.
    fn trim_to_ceiling<V: Clone>(map: &DashMap<String, V>, ceiling: usize) {
        if map.len() <= ceiling {
            return;
        }
        let mut keys: Vec<String> = map.iter().map(|entry| entry.key().clone()).collect();
        keys.sort_unstable();
        let drop_count = keys.len() - ceiling;
        for key in keys.into_iter().take(drop_count) {
            map.remove(&key);
        }
    }

    /// §4.B startup integrity validation: `device-list._index` and
    /// `session._index` must exist, and the pre-key at
    /// `next_pre_key_id - 1` must be present. Returns `true` if a batch
    /// regeneration of [`INTEGRITY_BATCH_SIZE`] pre-keys is required before
    /// login proceeds.
    pub async fn needs_integrity_batch(&self) -> bool {
        let highest = self.highest_pre_key_id().await.ok().flatten();
        match highest {
            Some(id) if id > 0 => self.pre_keys.get(&(id - 1)).is_none(),
            _ => true,
        }
    }
}

#[async_trait]
impl CredsStore for InMemorySignalStore {
    async fn load_creds(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.creds.get(&()).map(|entry| entry.clone()))
    }

    async fn store_creds(&self, blob: Vec<u8>) -> Result<(), StoreError> {
        self.creds.insert((), blob);
        Ok(())
    }
}

#[async_trait]
impl PreKeyStore for InMemorySignalStore {
    async fn load_pre_key(&self, key_id: u32) -> Result<Option<KeyPair>, StoreError> {
        Ok(self.pre_keys.get(&key_id).map(|entry| *entry))
    }

    async fn store_pre_key(&self, key_id: u32, key: KeyPair) -> Result<(), StoreError> {
        self.pre_keys.insert(key_id, key);
        Ok(())
    }

    async fn delete_pre_key(&self, key_id: u32) -> Result<(), StoreError> {
        self.pre_keys.remove(&key_id);
        Ok(())
    }

    async fn highest_pre_key_id(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.pre_keys.iter().map(|entry| *entry.key()).max())
    }
}

#[async_trait]
impl SignedPreKeyStore for InMemorySignalStore {
    async fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        Ok(self.signed_pre_keys.get(&key_id).map(|entry| entry.clone()))
    }

    async fn store_signed_pre_key(&self, record: SignedPreKeyRecord) -> Result<(), StoreError> {
        self.signed_pre_keys.insert(record.id, record);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySignalStore {
    async fn load_session(&self, address: &str) -> Result<Option<SessionBlob>, StoreError> {
        Ok(self.sessions.get(address).map(|entry| entry.clone()))
    }

    async fn store_session(&self, address: &str, blob: SessionBlob) -> Result<(), StoreError> {
        self.sessions.insert(address.to_owned(), blob);
        Self::trim_to_ceiling(&self.sessions, INDEX_CEILING);
        Ok(())
    }

    async fn delete_session(&self, address: &str) -> Result<(), StoreError> {
        self.sessions.remove(address);
        Ok(())
    }

    async fn session_index(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.sessions.iter().map(|entry| entry.key().clone()).collect())
    }
}

#[async_trait]
impl SenderKeyStore for InMemorySignalStore {
    async fn load_sender_key(&self, group_jid: &str, sender_address: &str) -> Result<Option<SenderKeyRecord>, StoreError> {
        Ok(self
            .sender_keys
            .get(&(group_jid.to_owned(), sender_address.to_owned()))
            .map(|entry| entry.clone()))
    }

    async fn store_sender_key(&self, group_jid: &str, sender_address: &str, record: SenderKeyRecord) -> Result<(), StoreError> {
        self.sender_keys.insert((group_jid.to_owned(), sender_address.to_owned()), record);
        Ok(())
    }
}

#[async_trait]
impl SenderKeyMemoryStore for InMemorySignalStore {
    async fn has_received(&self, group_jid: &str, epoch: &str, device_jid: &str) -> Result<bool, StoreError> {
        Ok(self
            .sender_key_memory
            .get(group_jid)
            .and_then(|epochs| epochs.get(epoch).map(|devices| devices.contains(device_jid)))
            .unwrap_or(false))
    }

    async fn mark_received(&self, group_jid: &str, epoch: &str, device_jid: &str) -> Result<(), StoreError> {
        let mut epochs = self.sender_key_memory.entry(group_jid.to_owned()).or_default();
        epochs.entry(epoch.to_owned()).or_default().insert(device_jid.to_owned());
        Ok(())
    }

    async fn reset_group(&self, group_jid: &str) -> Result<(), StoreError> {
        self.sender_key_memory.remove(group_jid);
        Ok(())
    }
}

#[async_trait]
impl DeviceListStore for InMemorySignalStore {
    async fn load_devices(&self, user: &str) -> Result<Option<Vec<u32>>, StoreError> {
        Ok(self.device_lists.get(user).map(|entry| entry.clone()))
    }

    async fn store_devices(&self, user: &str, devices: Vec<u32>) -> Result<(), StoreError> {
        self.device_lists.insert(user.to_owned(), devices);
        Self::trim_to_ceiling(&self.device_lists, INDEX_CEILING);
        Ok(())
    }
}

#[async_trait]
impl LidMappingStore for InMemorySignalStore {
    async fn lid_for_pn(&self, pn_user: &str) -> Result<Option<String>, StoreError> {
        Ok(self.pn_to_lid.get(pn_user).map(|entry| entry.clone()))
    }

    async fn pn_for_lid(&self, lid_user: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lid_to_pn.get(lid_user).map(|entry| entry.clone()))
    }

    async fn insert_mapping(&self, pn_user: &str, lid_user: &str) -> Result<bool, StoreError> {
        if let Some(existing) = self.pn_to_lid.get(pn_user) {
            if existing.as_str() != lid_user {
                tracing::warn!(pn_user, existing = existing.as_str(), attempted = lid_user, "rejecting lid mapping overwrite");
                return Ok(false);
            }
            return Ok(true);
        }

        self.pn_to_lid.insert(pn_user.to_owned(), lid_user.to_owned());
        self.lid_to_pn.insert(lid_user.to_owned(), pn_user.to_owned());
        Self::trim_to_ceiling(&self.pn_to_lid, LID_MAPPING_CEILING);
        Ok(true)
    }
}

#[async_trait]
impl AppStateSyncKeyStore for InMemorySignalStore {
    async fn load_app_state_key(&self, key_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.app_state_keys.get(key_id).map(|entry| entry.clone()))
    }

    async fn store_app_state_key(&self, key_id: &str, key: Vec<u8>) -> Result<(), StoreError> {
        self.app_state_keys.insert(key_id.to_owned(), key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lid_mapping_is_write_once() {
        let store = InMemorySignalStore::new();
        assert!(store.insert_mapping("15551234567", "lid-1").await.unwrap());
        assert!(store.insert_mapping("15551234567", "lid-1").await.unwrap());
        assert!(!store.insert_mapping("15551234567", "lid-2").await.unwrap());
        assert_eq!(store.lid_for_pn("15551234567").await.unwrap().as_deref(), Some("lid-1"));
        assert_eq!(store.pn_for_lid("lid-1").await.unwrap().as_deref(), Some("15551234567"));
    }

    #[tokio::test]
    async fn sender_key_memory_tracks_per_device_once() {
        let store = InMemorySignalStore::new();
        assert!(!store.has_received("group@g.us", "epoch-1", "111.0").await.unwrap());
        store.mark_received("group@g.us", "epoch-1", "111.0").await.unwrap();
        assert!(store.has_received("group@g.us", "epoch-1", "111.0").await.unwrap());
        assert!(!store.has_received("group@g.us", "epoch-2", "111.0").await.unwrap());
        store.reset_group("group@g.us").await.unwrap();
        assert!(!store.has_received("group@g.us", "epoch-1", "111.0").await.unwrap());
    }

    #[tokio::test]
    async fn needs_integrity_batch_when_empty() {
        let store = InMemorySignalStore::new();
        assert!(store.needs_integrity_batch().await);
        store.store_pre_key(0, crate::keys::generate_keypair()).await.unwrap();
        assert!(!store.needs_integrity_batch().await);
    }

    #[tokio::test]
    async fn transaction_serializes_same_key_writers() {
        let store = Arc::new(InMemorySignalStore::new());
        let a = store.clone();
        let b = store.clone();

        let task_a = tokio::spawn(async move {
            a.transaction("peer", || async {
                a.store_session("peer", vec![1]).await?;
                Ok::<_, StoreError>(())
            })
            .await
        });
        let task_b = tokio::spawn(async move {
            b.transaction("peer", || async {
                b.store_session("peer", vec![2]).await?;
                Ok::<_, StoreError>(())
            })
            .await
        });

        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
        assert!(store.load_session("peer").await.unwrap().is_some());
    }
}
