//! Device & LID resolver (§4.F): turns a set of requested JIDs into
//! concrete `(user, device, jid)` destinations, backed by a device-list
//! cache, the LID↔PN bijection, and a USync round-trip for cache misses.

use std::time::Duration;

use moka::future::Cache;

use crate::error::DeviceResolverError;
use crate::session::PreKeyBundle;
use crate::store::{LidMappingStore, SignalStore};

/// Device id excluded from every fan-out per the recorded Open Question
/// decision: WhatsApp reserves device 99 for a hosted/server-side device
/// that never receives 1:1 or group traffic directly.
const EXCLUDED_DEVICE_ID: u32 = 99;

/// How long an own-device PN→LID session migration is remembered so a
/// stale inbound PN-addressed message doesn't recreate the old session.
const MIGRATION_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A destination JID fully resolved to a concrete device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub user: String,
    pub device: u32,
    /// Final server-qualified JID string to address on the wire.
    pub jid: String,
}

/// One user's USync response: device list plus LID, if assigned.
#[derive(Debug, Clone)]
pub struct UsyncResult {
    pub user: String,
    pub devices: Vec<u32>,
    pub lid: Option<String>,
}

/// Issues the USync `iq` round-trip; implemented by the connection
/// supervisor in the full client.
#[async_trait::async_trait]
pub trait UsyncClient: Send + Sync {
    async fn query(&self, users: &[String]) -> Result<Vec<UsyncResult>, DeviceResolverError>;
}

/// Fetches a pre-key bundle for a single address; implemented by the
/// connection supervisor's `key` IQ handler.
#[async_trait::async_trait]
pub trait PreKeyFetcher: Send + Sync {
    async fn fetch_bundle(&self, address: &str) -> Result<PreKeyBundle, DeviceResolverError>;
}

/// A bare `user[:device]@server`-shaped address, decoded enough for the
/// resolver pipeline to branch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jid {
    pub user: String,
    pub device: Option<u32>,
    pub server: String,
}

impl Jid {
    pub fn parse(raw: &str) -> Option<Self> {
        let (left, server) = raw.split_once('@')?;
        match left.split_once(':') {
            Some((user, device)) => Some(Self {
                user: user.to_owned(),
                device: device.parse().ok(),
                server: server.to_owned(),
            }),
            None => Some(Self { user: left.to_owned(), device: None, server: server.to_owned() }),
        }
    }

    pub fn to_address(&self, device: u32) -> String {
        format!("{}:{}@{}", self.user, device, self.server)
    }

    pub fn is_lid(&self) -> bool {
        self.server == "lid"
    }
}

/// Caches device lists and per-address session-exists flags in process
/// memory; USync misses and `assertSessions` hits both consult this first.
pub struct DeviceResolver {
    device_cache: Cache<String, Vec<u32>>,
    session_exists_cache: Cache<String, bool>,
    migration_cache: Cache<String, ()>,
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceResolver {
    pub fn new() -> Self {
        Self {
            device_cache: Cache::builder().max_capacity(500).build(),
            session_exists_cache: Cache::builder().max_capacity(2000).build(),
            migration_cache: Cache::builder().max_capacity(500).time_to_live(MIGRATION_CACHE_TTL).build(),
        }
    }

    /// Resolves each input JID to its concrete device destinations (§4.F
    /// steps 1-5).
    pub async fn resolve<S, U>(&self, store: &S, usync: &U, jids: &[String]) -> Result<Vec<ResolvedDestination>, DeviceResolverError>
    where
        S: SignalStore,
        U: UsyncClient,
    {
        let mut resolved = Vec::new();
        let mut misses: Vec<Jid> = Vec::new();

        for raw in jids {
            let Some(jid) = Jid::parse(raw) else { continue };

            if let Some(device) = jid.device {
                resolved.push(ResolvedDestination { user: jid.user.clone(), device, jid: raw.clone() });
                continue;
            }

            if let Some(cached) = self.device_cache.get(&jid.user).await {
                self.push_resolved(store, &jid, &cached, &mut resolved).await?;
            } else {
                misses.push(jid);
            }
        }

        if misses.is_empty() {
            return Ok(resolved);
        }

        let users: Vec<String> = misses.iter().map(|jid| jid.user.clone()).collect();
        let results = usync.query(&users).await?;

        for result in &results {
            if let Some(lid) = &result.lid {
                let inserted = store.insert_mapping(&result.user, lid).await?;
                if !inserted {
                    return Err(DeviceResolverError::LidMappingConflict { pn_user: result.user.clone() });
                }
            }
            self.device_cache.insert(result.user.clone(), result.devices.clone()).await;
            store.store_devices(&result.user, result.devices.clone()).await?;
        }

        for jid in &misses {
            let Some(result) = results.iter().find(|result| result.user == jid.user) else { continue };
            self.push_resolved(store, jid, &result.devices, &mut resolved).await?;
        }

        Ok(resolved)
    }

    async fn push_resolved<S: SignalStore>(&self, store: &S, jid: &Jid, devices: &[u32], out: &mut Vec<ResolvedDestination>) -> Result<(), DeviceResolverError> {
        // Emit the correct server: LID users resolve to LID-addressed
        // destinations, everyone else to PN-addressed ones.
        let emit_as_lid = jid.is_lid() || store.lid_for_pn(&jid.user).await?.is_some();
        let emit_user = if emit_as_lid {
            match store.lid_for_pn(&jid.user).await? {
                Some(lid) => lid,
                None => jid.user.clone(),
            }
        } else {
            jid.user.clone()
        };
        let emit_server = if emit_as_lid { "lid" } else { jid.server.as_str() };

        for &device in devices {
            if device == EXCLUDED_DEVICE_ID {
                continue;
            }
            out.push(ResolvedDestination {
                user: emit_user.clone(),
                device,
                jid: format!("{emit_user}:{device}@{emit_server}"),
            });
        }
        Ok(())
    }

    /// Records the own device's LID after a successful pairing/login and
    /// migrates any existing PN-addressed sessions to the LID address
    /// (§4.F "Own-device handling").
    pub async fn handle_own_device_login<S>(&self, store: &S, own_pn_user: &str, own_lid_user: &str, own_device_id: u32) -> Result<(), DeviceResolverError>
    where
        S: SignalStore,
    {
        let inserted = store.insert_mapping(own_pn_user, own_lid_user).await?;
        if !inserted {
            return Err(DeviceResolverError::LidMappingConflict { pn_user: own_pn_user.to_owned() });
        }

        let mut devices = store.load_devices(own_pn_user).await?.unwrap_or_default();
        if !devices.contains(&own_device_id) {
            devices.push(own_device_id);
        }
        store.store_devices(own_lid_user, devices).await?;
        self.device_cache.invalidate(own_pn_user).await;

        let pn_address = format!("{own_pn_user}:{own_device_id}@s.whatsapp.net");
        if let Some(session) = store.load_session(&pn_address).await? {
            let lid_address = format!("{own_lid_user}:{own_device_id}@lid");
            store.store_session(&lid_address, session).await?;
            store.delete_session(&pn_address).await?;
            self.migration_cache.insert(pn_address, ()).await;
        }

        Ok(())
    }

    /// Returns whether `pn_address` was migrated to a LID session within
    /// the last 7 days, so callers know not to resurrect it.
    pub async fn was_recently_migrated(&self, pn_address: &str) -> bool {
        self.migration_cache.get(pn_address).await.is_some()
    }

    /// Clears the cached session-exists flag for `address`, forcing the
    /// next `assert_sessions` call to re-check it (§7 "Recoverable-crypto":
    /// a bad-MAC/corrupt decrypt invalidates the cached validity so the
    /// next send re-runs `assertSessions(force=true)`).
    pub async fn invalidate_session(&self, address: &str) {
        self.session_exists_cache.invalidate(address).await;
    }

    /// `assertSessions`: ensures an open 1:1 session exists for every
    /// address, fetching pre-key bundles for misses (or when `force` is
    /// set) and initializing outgoing sessions for them.
    pub async fn assert_sessions<S, F>(&self, store: &S, fetcher: &F, addresses: &[String], force: bool, local_identity: crate::keys::KeyPair) -> Result<(), DeviceResolverError>
    where
        S: SignalStore,
        F: PreKeyFetcher,
    {
        let mut needing_fetch = Vec::new();
        for address in addresses {
            let cached_open = self.session_exists_cache.get(address).await.unwrap_or(false);
            if force || !cached_open {
                if crate::session::is_open(store, address).await.map_err(|error| DeviceResolverError::UsyncFailed(error.to_string()))? {
                    self.session_exists_cache.insert(address.clone(), true).await;
                    if !force {
                        continue;
                    }
                }
                needing_fetch.push(address.clone());
            }
        }

        for address in needing_fetch {
            let bundle = fetcher.fetch_bundle(&address).await?;
            crate::session::init_outgoing_session(store, &address, local_identity, &bundle)
                .await
                .map_err(|error| DeviceResolverError::UsyncFailed(error.to_string()))?;
            self.session_exists_cache.insert(address, true).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySignalStore;

    struct FakeUsync {
        results: Vec<UsyncResult>,
    }

    #[async_trait::async_trait]
    impl UsyncClient for FakeUsync {
        async fn query(&self, _users: &[String]) -> Result<Vec<UsyncResult>, DeviceResolverError> {
            Ok(self.results.clone())
        }
    }

    #[tokio::test]
    async fn resolves_cache_miss_and_excludes_device_99() {
        let store = InMemorySignalStore::new();
        let resolver = DeviceResolver::new();
        let usync = FakeUsync {
            results: vec![UsyncResult { user: "5551234".to_owned(), devices: vec![0, 1, 99], lid: None }],
        };

        let resolved = resolver.resolve(&store, &usync, &["5551234@s.whatsapp.net".to_owned()]).await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|dest| dest.device != 99));
    }

    #[tokio::test]
    async fn explicit_device_suffix_bypasses_usync() {
        let store = InMemorySignalStore::new();
        let resolver = DeviceResolver::new();
        let usync = FakeUsync { results: vec![] };

        let resolved = resolver.resolve(&store, &usync, &["5551234:2@s.whatsapp.net".to_owned()]).await.unwrap();

        assert_eq!(resolved, vec![ResolvedDestination { user: "5551234".to_owned(), device: 2, jid: "5551234:2@s.whatsapp.net".to_owned() }]);
    }

    #[tokio::test]
    async fn own_device_login_migrates_pn_session_to_lid() {
        let store = InMemorySignalStore::new();
        let resolver = DeviceResolver::new();
        store.store_session("5551234:0@s.whatsapp.net", vec![1, 2, 3]).await.unwrap();

        resolver.handle_own_device_login(&store, "5551234", "900000001", 0).await.unwrap();

        assert!(store.load_session("5551234:0@s.whatsapp.net").await.unwrap().is_none());
        assert_eq!(store.load_session("900000001:0@lid").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(resolver.was_recently_migrated("5551234:0@s.whatsapp.net").await);
    }
}
