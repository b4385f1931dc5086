//! 1:1 double-ratchet session cipher (§4.C). Replaces the XOR-stream
//! placeholder the teacher shipped with a real X3DH bootstrap and
//! Signal-style symmetric-key + Diffie-Hellman ratchet.

use std::collections::HashMap;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::SessionError;
use crate::keys::KeyPair;
use crate::store::{SessionBlob, SignalStore};

type HmacSha256 = Hmac<Sha256>;

/// Bound on how many out-of-order message keys a single chain will cache
/// before refusing to ratchet further ahead (mirrors libsignal's own cap).
const MAX_SKIPPED_MESSAGE_KEYS: usize = 2000;

/// Wire type of a 1:1 ciphertext (§4.C / GLOSSARY `pkmsg`/`msg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// First message on a session; embeds the X3DH bundle material so the
    /// receiver can build its side of the session.
    PreKey,
    /// Ordinary ratchet message on an already-established session.
    Normal,
}

/// Pre-key bundle fetched from the server to bootstrap an outgoing session.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub one_time_pre_key_id: Option<u32>,
    pub one_time_pre_key: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    key: [u8; 32],
    counter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    local_identity: [u8; 32],
    remote_identity: [u8; 32],
    root_key: [u8; 32],
    dh_self: KeyPair,
    dh_remote: Option<[u8; 32]>,
    send_chain: Option<ChainState>,
    recv_chain: Option<ChainState>,
    /// Message count sent under the previous sending chain, carried in the
    /// header so the receiver knows how many messages to skip there.
    prev_chain_count: u32,
    /// Keyed by `(dh_remote_public, counter)`.
    skipped_keys: HashMap<([u8; 32], u32), [u8; 32]>,
    /// True until the first message from the remote side is decrypted;
    /// governs whether `encrypt` wraps the ratchet message in a pkmsg.
    awaiting_initial_reply: bool,
    /// X3DH bundle material embedded in every pkmsg until the remote
    /// confirms receipt.
    pending_bundle_header: Option<PendingBundleHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingBundleHeader {
    registration_id: u32,
    base_key: [u8; 32],
    signed_pre_key_id: u32,
    one_time_pre_key_id: Option<u32>,
}

/// Initializes an outgoing session via X3DH against a fetched pre-key
/// bundle, persists it, and leaves it ready for `encrypt`.
pub async fn init_outgoing_session<S: SignalStore>(
    store: &S,
    address: &str,
    local_identity: KeyPair,
    bundle: &PreKeyBundle,
) -> Result<(), SessionError> {
    if bundle.signed_pre_key_signature == [0_u8; 64] {
        return Err(SessionError::InvalidBundle);
    }
    if !crate::keys::verify_message(bundle.identity_key, &bundle.signed_pre_key, &bundle.signed_pre_key_signature) {
        return Err(SessionError::InvalidBundle);
    }

    let ephemeral = crate::keys::generate_keypair();

    let dh1 = x25519(local_identity.private, bundle.signed_pre_key);
    let dh2 = x25519(ephemeral.private, bundle.identity_key);
    let dh3 = x25519(ephemeral.private, bundle.signed_pre_key);
    let mut ikm = Vec::with_capacity(32 * 4);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(one_time) = bundle.one_time_pre_key {
        ikm.extend_from_slice(&x25519(ephemeral.private, one_time));
    }

    let root_key = kdf_root_seed(&ikm);
    let dh_self = crate::keys::generate_keypair();
    let (new_root, send_key) = kdf_rk(root_key, &x25519(dh_self.private, bundle.signed_pre_key));

    let record = SessionRecord {
        local_identity: local_identity.public,
        remote_identity: bundle.identity_key,
        root_key: new_root,
        dh_self,
        dh_remote: Some(bundle.signed_pre_key),
        send_chain: Some(ChainState { key: send_key, counter: 0 }),
        recv_chain: None,
        prev_chain_count: 0,
        skipped_keys: HashMap::new(),
        awaiting_initial_reply: true,
        pending_bundle_header: Some(PendingBundleHeader {
            registration_id: bundle.registration_id,
            base_key: ephemeral.public,
            signed_pre_key_id: bundle.signed_pre_key_id,
            one_time_pre_key_id: bundle.one_time_pre_key_id,
        }),
    };

    store_record(store, address, &record).await
}

/// Returns whether a session with a usable sender chain already exists
/// (§4.C "open" session).
pub async fn is_open<S: SignalStore>(store: &S, address: &str) -> Result<bool, SessionError> {
    match load_record(store, address).await? {
        Some(record) => Ok(record.send_chain.is_some() || record.dh_remote.is_some()),
        None => Ok(false),
    }
}

/// Encrypts `plaintext` for `address`, returning the wire type and ciphertext.
pub async fn encrypt<S: SignalStore>(
    store: &S,
    address: &str,
    plaintext: &[u8],
) -> Result<(MessageType, Vec<u8>), SessionError> {
    let mut record = load_record(store, address).await?.ok_or_else(|| SessionError::NoSession(address.to_owned()))?;

    let dh_remote = record.dh_remote.ok_or_else(|| SessionError::NoSession(address.to_owned()))?;
    if record.send_chain.is_none() {
        let (new_root, send_key) = kdf_rk(record.root_key, &x25519(record.dh_self.private, dh_remote));
        record.root_key = new_root;
        record.send_chain = Some(ChainState { key: send_key, counter: 0 });
    }

    let chain = record.send_chain.as_mut().expect("checked above");
    let counter = chain.counter;
    let (message_key, next_chain_key) = kdf_ck(chain.key);
    chain.key = next_chain_key;
    chain.counter = chain
        .counter
        .checked_add(1)
        .ok_or_else(|| SessionError::CounterExhausted(address.to_owned()))?;

    let ciphertext = aead_encrypt(&message_key, plaintext)?;
    let normal_message = encode_ratchet_message(&record.dh_self.public, record.prev_chain_count, counter, &ciphertext);

    let (message_type, wire) = if record.awaiting_initial_reply {
        let header = record
            .pending_bundle_header
            .clone()
            .expect("awaiting_initial_reply implies a pending bundle header");
        (MessageType::PreKey, encode_pre_key_message(&header, record.local_identity, &normal_message))
    } else {
        (MessageType::Normal, normal_message)
    };

    store_record(store, address, &record).await?;
    Ok((message_type, wire))
}

/// Decrypts an inbound payload of either wire type, advancing the ratchet.
pub async fn decrypt<S: SignalStore>(
    store: &S,
    address: &str,
    message_type: MessageType,
    payload: &[u8],
    local_identity: KeyPair,
) -> Result<Vec<u8>, SessionError> {
    let (ratchet_payload, bootstrap) = match message_type {
        MessageType::Normal => (payload, None),
        MessageType::PreKey => {
            let (header, sender_identity, rest) = decode_pre_key_message(payload)?;
            (rest, Some((header, sender_identity)))
        }
    };

    let mut record = match load_record(store, address).await? {
        Some(existing) => existing,
        None => {
            let (header, sender_identity) = bootstrap.ok_or_else(|| SessionError::NoSession(address.to_owned()))?;

            let signed_pre_key = store
                .load_signed_pre_key(header.signed_pre_key_id)
                .await?
                .ok_or_else(|| SessionError::Corrupt(address.to_owned(), "unknown signed pre-key id in pkmsg".to_owned()))?
                .key_pair;
            let one_time_pre_key = match header.one_time_pre_key_id {
                Some(id) => store.load_pre_key(id).await?,
                None => None,
            };

            let record = bootstrap_incoming_session(local_identity, sender_identity, &header, signed_pre_key, one_time_pre_key)?;

            if let Some(id) = header.one_time_pre_key_id {
                store.delete_pre_key(id).await?;
            }

            record
        }
    };

    let (dh_sender, prev_count, counter, ciphertext) =
        decode_ratchet_message(ratchet_payload).map_err(|_| SessionError::Corrupt(address.to_owned(), "malformed ratchet header".to_owned()))?;

    if record.dh_remote != Some(dh_sender) {
        ratchet_receiving_chain(&mut record, dh_sender, prev_count)?;
    }

    let message_key = advance_or_fetch_skipped(&mut record, dh_sender, counter)?;
    let plaintext = aead_decrypt(&message_key, ciphertext).map_err(|_| SessionError::BadMac(address.to_owned()))?;

    record.awaiting_initial_reply = false;
    record.pending_bundle_header = None;
    store_record(store, address, &record).await?;
    Ok(plaintext)
}

fn bootstrap_incoming_session(
    local_identity: KeyPair,
    sender_identity: [u8; 32],
    header: &PendingBundleHeader,
    signed_pre_key: KeyPair,
    one_time_pre_key: Option<KeyPair>,
) -> Result<SessionRecord, SessionError> {
    // Responder-side X3DH mirrors the initiator's DH1/DH2/DH3[/DH4] by DH
    // symmetry, with operands swapped to use our private halves against
    // their public ones: DH1 = our signed pre-key × their identity key,
    // DH2 = our identity key × their base (ephemeral) key, DH3 = our
    // signed pre-key × their base key, DH4 = our one-time pre-key (if
    // consumed) × their base key.
    let dh1 = x25519(signed_pre_key.private, sender_identity);
    let dh2 = x25519(local_identity.private, header.base_key);
    let dh3 = x25519(signed_pre_key.private, header.base_key);
    let mut ikm = Vec::with_capacity(32 * 4);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(one_time) = one_time_pre_key {
        ikm.extend_from_slice(&x25519(one_time.private, header.base_key));
    }

    let root_key = kdf_root_seed(&ikm);

    // `dh_self` must be the signed pre-key, not a fresh ratchet key: the
    // initiator's first DH-ratchet step derives its send chain from
    // DH(their fresh ratchet key, our signed pre-key), so our receiving
    // side can only reproduce it from the signed pre-key's private half.
    // `dh_remote`/the chains stay unset until `decrypt`'s
    // `ratchet_receiving_chain` call runs that matching step against the
    // ratchet message's own embedded DH public key (not `header.base_key`,
    // which is the X3DH ephemeral and a distinct value).
    Ok(SessionRecord {
        local_identity: local_identity.public,
        remote_identity: sender_identity,
        root_key,
        dh_self: signed_pre_key,
        dh_remote: None,
        send_chain: None,
        recv_chain: None,
        prev_chain_count: 0,
        skipped_keys: HashMap::new(),
        awaiting_initial_reply: false,
        pending_bundle_header: None,
    })
}

fn ratchet_receiving_chain(record: &mut SessionRecord, new_dh_remote: [u8; 32], prev_count: u32) -> Result<(), SessionError> {
    if let Some(chain) = record.recv_chain.clone() {
        cache_skipped_keys(record, chain, prev_count)?;
    }

    if let Some(send_chain) = record.send_chain.take() {
        record.prev_chain_count = send_chain.counter;
    }

    let (root_after_recv, recv_key) = kdf_rk(record.root_key, &x25519(record.dh_self.private, new_dh_remote));
    record.dh_remote = Some(new_dh_remote);
    record.recv_chain = Some(ChainState { key: recv_key, counter: 0 });

    record.dh_self = crate::keys::generate_keypair();
    let (root_after_send, send_key) = kdf_rk(root_after_recv, &x25519(record.dh_self.private, new_dh_remote));
    record.root_key = root_after_send;
    record.send_chain = Some(ChainState { key: send_key, counter: 0 });
    Ok(())
}

fn cache_skipped_keys(record: &mut SessionRecord, mut chain: ChainState, up_to: u32) -> Result<(), SessionError> {
    let Some(dh_remote) = record.dh_remote else { return Ok(()) };
    while chain.counter < up_to {
        if record.skipped_keys.len() >= MAX_SKIPPED_MESSAGE_KEYS {
            break;
        }
        let (message_key, next_key) = kdf_ck(chain.key);
        record.skipped_keys.insert((dh_remote, chain.counter), message_key);
        chain.key = next_key;
        chain.counter += 1;
    }
    Ok(())
}

fn advance_or_fetch_skipped(record: &mut SessionRecord, dh_remote: [u8; 32], counter: u32) -> Result<[u8; 32], SessionError> {
    if let Some(key) = record.skipped_keys.remove(&(dh_remote, counter)) {
        return Ok(key);
    }

    let chain = record.recv_chain.as_mut().ok_or_else(|| SessionError::Corrupt("session".to_owned(), "no receiving chain".to_owned()))?;
    if counter < chain.counter {
        return Err(SessionError::Corrupt("session".to_owned(), "counter behind chain and not cached".to_owned()));
    }

    while chain.counter < counter {
        if record.skipped_keys.len() >= MAX_SKIPPED_MESSAGE_KEYS {
            return Err(SessionError::Corrupt("session".to_owned(), "too many skipped messages".to_owned()));
        }
        let (message_key, next_key) = kdf_ck(chain.key);
        record.skipped_keys.insert((dh_remote, chain.counter), message_key);
        chain.key = next_key;
        chain.counter += 1;
    }

    let (message_key, next_key) = kdf_ck(chain.key);
    chain.key = next_key;
    chain.counter += 1;
    Ok(message_key)
}

fn kdf_root_seed(ikm: &[u8]) -> [u8; 32] {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(&[0_u8; 32]), ikm);
    let mut out = [0_u8; 32];
    hk.expand(b"wa-md-core-x3dh", &mut out).expect("32-byte expand never fails");
    out
}

fn kdf_rk(root_key: [u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(&root_key), dh_out);
    let mut output = [0_u8; 64];
    hk.expand(b"wa-md-core-ratchet", &mut output).expect("64-byte expand never fails");
    let mut new_root = [0_u8; 32];
    new_root.copy_from_slice(&output[..32]);
    let mut chain_key = [0_u8; 32];
    chain_key.copy_from_slice(&output[32..]);
    (new_root, chain_key)
}

fn kdf_ck(chain_key: [u8; 32]) -> ([u8; 32], [u8; 32]) {
    let message_key = hmac_sha256(&chain_key, &[0x01]);
    let next_chain_key = hmac_sha256(&chain_key, &[0x02]);
    (message_key, next_chain_key)
}

fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let mut out = [0_u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn x25519(private: [u8; 32], peer_public: [u8; 32]) -> [u8; 32] {
    use x25519_dalek::{PublicKey, StaticSecret};
    StaticSecret::from(private).diffie_hellman(&PublicKey::from(peer_public)).to_bytes()
}

fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SessionError::Corrupt("message".to_owned(), "bad key length".to_owned()))?;
    cipher
        .encrypt(Nonce::from_slice(&[0_u8; 12]), Payload { msg: plaintext, aad: &[] })
        .map_err(|_| SessionError::Corrupt("message".to_owned(), "encrypt failed".to_owned()))
}

fn aead_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| aes_gcm::Error)?;
    cipher.decrypt(Nonce::from_slice(&[0_u8; 12]), Payload { msg: ciphertext, aad: &[] })
}

fn encode_ratchet_message(dh_public: &[u8; 32], prev_counter: u32, counter: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 4 + 4 + ciphertext.len());
    out.extend_from_slice(dh_public);
    out.extend_from_slice(&prev_counter.to_be_bytes());
    out.extend_from_slice(&counter.to_be_bytes());
    out.extend_from_slice(ciphertext);
    out
}

fn decode_ratchet_message(payload: &[u8]) -> Result<([u8; 32], u32, u32, &[u8]), ()> {
    if payload.len() < 40 {
        return Err(());
    }
    let mut dh_public = [0_u8; 32];
    dh_public.copy_from_slice(&payload[..32]);
    let prev_counter = u32::from_be_bytes(payload[32..36].try_into().unwrap());
    let counter = u32::from_be_bytes(payload[36..40].try_into().unwrap());
    Ok((dh_public, prev_counter, counter, &payload[40..]))
}

fn encode_pre_key_message(header: &PendingBundleHeader, local_identity: [u8; 32], ratchet_message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + 4 + 4 + 32 + 32 + ratchet_message.len());
    out.extend_from_slice(&header.registration_id.to_be_bytes());
    match header.one_time_pre_key_id {
        Some(id) => {
            out.push(1);
            out.extend_from_slice(&id.to_be_bytes());
        }
        None => out.push(0),
    }
    out.extend_from_slice(&header.signed_pre_key_id.to_be_bytes());
    out.extend_from_slice(&header.base_key);
    out.extend_from_slice(&local_identity);
    out.extend_from_slice(ratchet_message);
    out
}

fn decode_pre_key_message(payload: &[u8]) -> Result<(PendingBundleHeader, [u8; 32], &[u8]), SessionError> {
    if payload.len() < 4 + 1 + 4 + 32 + 32 {
        return Err(SessionError::Corrupt("pkmsg".to_owned(), "too short".to_owned()));
    }
    let registration_id = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let (one_time_pre_key_id, rest) = if payload[4] == 1 {
        (Some(u32::from_be_bytes(payload[5..9].try_into().unwrap())), &payload[9..])
    } else {
        (None, &payload[5..])
    };
    if rest.len() < 4 + 32 + 32 {
        return Err(SessionError::Corrupt("pkmsg".to_owned(), "too short".to_owned()));
    }
    let signed_pre_key_id = u32::from_be_bytes(rest[0..4].try_into().unwrap());
    let mut base_key = [0_u8; 32];
    base_key.copy_from_slice(&rest[4..36]);
    let mut sender_identity = [0_u8; 32];
    sender_identity.copy_from_slice(&rest[36..68]);

    Ok((
        PendingBundleHeader {
            registration_id,
            base_key,
            signed_pre_key_id,
            one_time_pre_key_id,
        },
        sender_identity,
        &rest[68..],
    ))
}

async fn load_record<S: SignalStore>(store: &S, address: &str) -> Result<Option<SessionRecord>, SessionError> {
    let blob: Option<SessionBlob> = store.load_session(address).await?;
    match blob {
        Some(bytes) => {
            let record = serde_json::from_slice(&bytes).map_err(|error| SessionError::Corrupt(address.to_owned(), error.to_string()))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

async fn store_record<S: SignalStore>(store: &S, address: &str, record: &SessionRecord) -> Result<(), SessionError> {
    let bytes = serde_json::to_vec(record).map_err(|error| SessionError::Corrupt(address.to_owned(), error.to_string()))?;
    store.store_session(address, bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemorySignalStore, PreKeyStore, SignedPreKeyRecord, SignedPreKeyStore};

    fn bundle_from(identity: KeyPair, signed: KeyPair, signed_id: u32) -> PreKeyBundle {
        let signature = crate::keys::sign_message(identity.private, identity.public, &signed.public);
        PreKeyBundle {
            registration_id: 42,
            identity_key: identity.public,
            signed_pre_key_id: signed_id,
            signed_pre_key: signed.public,
            signed_pre_key_signature: signature,
            one_time_pre_key_id: None,
            one_time_pre_key: None,
        }
    }

    #[tokio::test]
    async fn pkmsg_roundtrip_establishes_session_both_sides() {
        let store_a = InMemorySignalStore::new();
        let alice_identity = crate::keys::generate_keypair();
        let bob_identity = crate::keys::generate_keypair();
        let bob_signed = crate::keys::generate_keypair();

        let bundle = bundle_from(bob_identity, bob_signed, 1);
        init_outgoing_session(&store_a, "bob", alice_identity, &bundle).await.unwrap();

        let (message_type, wire) = encrypt(&store_a, "bob", b"hello bob").await.unwrap();
        assert_eq!(message_type, MessageType::PreKey);

        let store_b = InMemorySignalStore::new();
        store_b
            .store_signed_pre_key(SignedPreKeyRecord { id: 1, key_pair: bob_signed, signature: [0_u8; 64] })
            .await
            .unwrap();
        let plaintext = decrypt(&store_b, "alice", message_type, &wire, bob_identity).await.unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[tokio::test]
    async fn pkmsg_roundtrip_with_one_time_pre_key() {
        let store_a = InMemorySignalStore::new();
        let alice_identity = crate::keys::generate_keypair();
        let bob_identity = crate::keys::generate_keypair();
        let bob_signed = crate::keys::generate_keypair();
        let bob_one_time = crate::keys::generate_keypair();

        let mut bundle = bundle_from(bob_identity, bob_signed, 1);
        bundle.one_time_pre_key_id = Some(7);
        bundle.one_time_pre_key = Some(bob_one_time.public);
        init_outgoing_session(&store_a, "bob", alice_identity, &bundle).await.unwrap();

        let (message_type, wire) = encrypt(&store_a, "bob", b"hello again").await.unwrap();

        let store_b = InMemorySignalStore::new();
        store_b
            .store_signed_pre_key(SignedPreKeyRecord { id: 1, key_pair: bob_signed, signature: [0_u8; 64] })
            .await
            .unwrap();
        store_b.store_pre_key(7, bob_one_time).await.unwrap();

        let plaintext = decrypt(&store_b, "alice", message_type, &wire, bob_identity).await.unwrap();
        assert_eq!(plaintext, b"hello again");

        // The one-time pre-key must be consumed so it can't be reused.
        assert!(store_b.load_pre_key(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reply_roundtrips_back_to_initiator() {
        let store_a = InMemorySignalStore::new();
        let alice_identity = crate::keys::generate_keypair();
        let bob_identity = crate::keys::generate_keypair();
        let bob_signed = crate::keys::generate_keypair();

        let bundle = bundle_from(bob_identity, bob_signed, 1);
        init_outgoing_session(&store_a, "bob", alice_identity, &bundle).await.unwrap();
        let (message_type, wire) = encrypt(&store_a, "bob", b"hello bob").await.unwrap();

        let store_b = InMemorySignalStore::new();
        store_b
            .store_signed_pre_key(SignedPreKeyRecord { id: 1, key_pair: bob_signed, signature: [0_u8; 64] })
            .await
            .unwrap();
        decrypt(&store_b, "alice", message_type, &wire, bob_identity).await.unwrap();

        let (reply_type, reply_wire) = encrypt(&store_b, "alice", b"hi alice").await.unwrap();
        assert_eq!(reply_type, MessageType::Normal);

        let plaintext = decrypt(&store_a, "bob", reply_type, &reply_wire, alice_identity).await.unwrap();
        assert_eq!(plaintext, b"hi alice");
    }

    #[tokio::test]
    async fn tampered_ciphertext_on_bootstrap_yields_bad_mac() {
        let store_a = InMemorySignalStore::new();
        let alice_identity = crate::keys::generate_keypair();
        let bob_identity = crate::keys::generate_keypair();
        let bob_signed = crate::keys::generate_keypair();

        let bundle = bundle_from(bob_identity, bob_signed, 1);
        init_outgoing_session(&store_a, "bob", alice_identity, &bundle).await.unwrap();
        let (message_type, mut wire) = encrypt(&store_a, "bob", b"hello bob").await.unwrap();
        *wire.last_mut().unwrap() ^= 0xFF;

        let store_b = InMemorySignalStore::new();
        store_b
            .store_signed_pre_key(SignedPreKeyRecord { id: 1, key_pair: bob_signed, signature: [0_u8; 64] })
            .await
            .unwrap();

        let result = decrypt(&store_b, "alice", message_type, &wire, bob_identity).await;
        assert!(matches!(result, Err(SessionError::BadMac(_))));
    }

    #[tokio::test]
    async fn rejects_invalid_bundle_signature() {
        let store = InMemorySignalStore::new();
        let alice_identity = crate::keys::generate_keypair();
        let bob_identity = crate::keys::generate_keypair();
        let bob_signed = crate::keys::generate_keypair();

        let mut bundle = bundle_from(bob_identity, bob_signed, 1);
        bundle.signed_pre_key_signature[0] ^= 0xFF;

        let result = init_outgoing_session(&store, "bob", alice_identity, &bundle).await;
        assert!(matches!(result, Err(SessionError::InvalidBundle)));
    }

    #[tokio::test]
    async fn encrypt_without_session_is_no_session_error() {
        let store = InMemorySignalStore::new();
        let result = encrypt(&store, "nobody", b"x").await;
        assert!(matches!(result, Err(SessionError::NoSession(_))));
    }
}
