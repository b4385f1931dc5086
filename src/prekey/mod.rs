//! Pre-key inventory manager (§4.E): keeps the server-side pre-key supply
//! above a minimum, with an at-most-one upload guard and priority-driven
//! throttling.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::{Duration, Instant};

use crate::error::PreKeyError;
use crate::keys::KeyPair;
use crate::store::{PreKeyStore, SignedPreKeyRecord, SignedPreKeyStore};

const MIN_ON_SERVER: u32 = 5;
const CRITICAL_THRESHOLD: u32 = 3;
const INITIAL_BATCH_SIZE: u32 = 95;
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_UPLOAD_INTERVAL: Duration = Duration::from_secs(5);
const MAX_UPLOAD_ATTEMPTS: u32 = 3;

/// Why a check was requested; governs throttling and the fallback batch
/// size (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Talks to the server side of pre-key inventory; implemented by the
/// connection supervisor's IQ layer in the full client.
#[async_trait::async_trait]
pub trait PreKeyServer: Send + Sync {
    /// Number of pre-keys the server currently holds for this account.
    async fn query_available_count(&self) -> Result<u32, PreKeyError>;
    /// Uploads a freshly generated batch plus the current signed pre-key.
    async fn upload(&self, pre_keys: &[(u32, KeyPair)], signed_pre_key: &SignedPreKeyRecord) -> Result<(), PreKeyError>;
}

/// Coordinates pre-key checks across callers, enforcing the at-most-one
/// upload guard and the min-interval throttle.
pub struct PreKeyManager {
    uploading: AtomicBool,
    last_check: Mutex<Option<Instant>>,
    last_upload: Mutex<Option<Instant>>,
    /// Highest-priority check still pending because an upload was already
    /// in flight when it was requested; coalesced, not queued per-item.
    pending: Mutex<Option<Priority>>,
}

impl Default for PreKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PreKeyManager {
    pub fn new() -> Self {
        Self {
            uploading: AtomicBool::new(false),
            last_check: Mutex::new(None),
            last_upload: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Runs a check-and-maybe-upload cycle at the given priority, or
    /// coalesces it into the pending slot if an upload is already running.
    pub async fn request_check<S, Srv>(
        &self,
        store: &S,
        server: &Srv,
        priority: Priority,
        on_creds_update: impl Fn() + Send + Sync,
    ) -> Result<(), PreKeyError>
    where
        S: PreKeyStore + SignedPreKeyStore + Sync,
        Srv: PreKeyServer,
    {
        if priority != Priority::Critical && !self.throttle_allows(priority) {
            return Ok(());
        }

        if self.uploading.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if pending.is_none_or(|existing| priority > existing) {
                *pending = Some(priority);
            }
            return Ok(());
        }

        *self.last_check.lock().expect("last_check lock poisoned") = Some(Instant::now());

        let mut current_priority = priority;
        let result = loop {
            let outcome = self.run_once(store, server, current_priority, &on_creds_update).await;
            if outcome.is_err() {
                break outcome;
            }

            let next = self.pending.lock().expect("pending lock poisoned").take();
            match next {
                Some(next_priority) => current_priority = next_priority,
                None => break Ok(()),
            }
        };

        self.uploading.store(false, Ordering::SeqCst);
        result
    }

    fn throttle_allows(&self, _priority: Priority) -> bool {
        let last_check = self.last_check.lock().expect("last_check lock poisoned");
        match *last_check {
            Some(instant) => instant.elapsed() >= MIN_CHECK_INTERVAL,
            None => true,
        }
    }

    async fn run_once<S, Srv>(&self, store: &S, server: &Srv, priority: Priority, on_creds_update: &(impl Fn() + Send + Sync)) -> Result<(), PreKeyError>
    where
        S: PreKeyStore + SignedPreKeyStore + Sync,
        Srv: PreKeyServer,
    {
        let available = server.query_available_count().await?;

        let batch_size = if available <= CRITICAL_THRESHOLD {
            Some(INITIAL_BATCH_SIZE)
        } else if available < MIN_ON_SERVER {
            Some((MIN_ON_SERVER - available + 5).max(20))
        } else if priority == Priority::Critical {
            Some(20)
        } else {
            None
        };

        let Some(batch_size) = batch_size else { return Ok(()) };

        if priority != Priority::Critical {
            let last_upload = self.last_upload.lock().expect("last_upload lock poisoned");
            if let Some(instant) = *last_upload {
                if instant.elapsed() < MIN_UPLOAD_INTERVAL {
                    return Ok(());
                }
            }
        }

        self.upload_with_retry(store, server, batch_size, on_creds_update).await
    }

    async fn upload_with_retry<S, Srv>(&self, store: &S, server: &Srv, batch_size: u32, on_creds_update: &(impl Fn() + Send + Sync)) -> Result<(), PreKeyError>
    where
        S: PreKeyStore + SignedPreKeyStore + Sync,
        Srv: PreKeyServer,
    {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(UPLOAD_TIMEOUT, self.generate_and_upload(store, server, batch_size, on_creds_update)).await;

            match outcome {
                Ok(Ok(())) => {
                    *self.last_upload.lock().expect("last_upload lock poisoned") = Some(Instant::now());
                    return Ok(());
                }
                Ok(Err(error)) if attempt >= MAX_UPLOAD_ATTEMPTS => return Err(error),
                Err(_timeout) if attempt >= MAX_UPLOAD_ATTEMPTS => return Err(PreKeyError::UploadExhausted(attempt)),
                _ => {
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                }
            }
        }
    }

    async fn generate_and_upload<S, Srv>(&self, store: &S, server: &Srv, batch_size: u32, on_creds_update: &(impl Fn() + Send + Sync)) -> Result<(), PreKeyError>
    where
        S: PreKeyStore + SignedPreKeyStore + Sync,
        Srv: PreKeyServer,
    {
        let next_id = store.highest_pre_key_id().await?.map_or(1, |id| id + 1);
        let mut batch = Vec::with_capacity(batch_size as usize);
        for offset in 0..batch_size {
            let key = crate::keys::generate_keypair();
            let key_id = next_id + offset;
            store.store_pre_key(key_id, key).await?;
            batch.push((key_id, key));
        }

        let signed_pre_key = self.current_signed_pre_key(store).await?;

        on_creds_update();
        server.upload(&batch, &signed_pre_key).await
    }

    async fn current_signed_pre_key<S>(&self, store: &S) -> Result<SignedPreKeyRecord, PreKeyError>
    where
        S: SignedPreKeyStore + Sync,
    {
        if let Some(existing) = store.load_signed_pre_key(1).await? {
            return Ok(existing);
        }

        let identity = crate::keys::generate_keypair();
        let key_pair = crate::keys::generate_keypair();
        let signature = crate::keys::sign_message(identity.private, identity.public, &key_pair.public);
        let record = SignedPreKeyRecord { id: 1, key_pair, signature };
        store.store_signed_pre_key(record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySignalStore;
    use std::sync::atomic::AtomicU32;

    struct FakeServer {
        available: AtomicU32,
        uploads_seen: AtomicU32,
    }

    #[async_trait::async_trait]
    impl PreKeyServer for FakeServer {
        async fn query_available_count(&self) -> Result<u32, PreKeyError> {
            Ok(self.available.load(Ordering::SeqCst))
        }

        async fn upload(&self, pre_keys: &[(u32, KeyPair)], _signed_pre_key: &SignedPreKeyRecord) -> Result<(), PreKeyError> {
            self.available.fetch_add(pre_keys.len() as u32, Ordering::SeqCst);
            self.uploads_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn uploads_initial_batch_when_at_or_below_critical() {
        let store = InMemorySignalStore::new();
        let server = FakeServer { available: AtomicU32::new(2), uploads_seen: AtomicU32::new(0) };
        let manager = PreKeyManager::new();

        manager.request_check(&store, &server, Priority::Low, || {}).await.unwrap();

        assert_eq!(server.uploads_seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.highest_pre_key_id().await.unwrap(), Some(95));
    }

    #[tokio::test]
    async fn no_op_when_server_has_plenty_and_priority_is_low() {
        let store = InMemorySignalStore::new();
        let server = FakeServer { available: AtomicU32::new(50), uploads_seen: AtomicU32::new(0) };
        let manager = PreKeyManager::new();

        manager.request_check(&store, &server, Priority::Low, || {}).await.unwrap();

        assert_eq!(server.uploads_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn critical_priority_tops_up_even_with_plenty_available() {
        let store = InMemorySignalStore::new();
        let server = FakeServer { available: AtomicU32::new(50), uploads_seen: AtomicU32::new(0) };
        let manager = PreKeyManager::new();

        manager.request_check(&store, &server, Priority::Critical, || {}).await.unwrap();

        assert_eq!(server.uploads_seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.highest_pre_key_id().await.unwrap(), Some(20));
    }
}
