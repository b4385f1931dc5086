//! Group sender-key cipher (§4.D): AES-CBC message encryption under a
//! per-`(group, sender)` chain-key ratchet, plus sender-key distribution
//! (SKDM) tracking against `sender-key-memory`.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::error::GroupCipherError;
use crate::keys::KeyPair;
use crate::proto::SenderKeyDistributionMessage;
use crate::store::{SenderKeyRecord, SenderKeyState, SignalStore};

/// How far ahead of the current chain-key iteration a message may ratchet
/// before it's rejected outright (§4.D).
const MAX_FORWARD_ITERATIONS: u32 = 2000;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Creates a fresh sender-key state for a group this process originates,
/// and returns the SKDM to distribute to recipient devices.
pub async fn create_sender_key<S: SignalStore>(
    store: &S,
    group_jid: &str,
    sender_address: &str,
) -> Result<SenderKeyDistributionMessage, GroupCipherError> {
    let mut chain_key = [0_u8; 32];
    OsRng.fill_bytes(&mut chain_key);
    let signing_key = crate::keys::generate_keypair();
    let key_id = OsRng.next_u32();

    let state = SenderKeyState {
        key_id,
        iteration: 0,
        chain_key,
        signing_key,
        skipped_keys: Default::default(),
    };

    let skdm = SenderKeyDistributionMessage {
        group_id: group_jid.to_owned(),
        sender_key_id: key_id.to_be_bytes().to_vec(),
        iteration: 0,
        chain_key: chain_key.to_vec(),
        signing_key: signing_key.public.to_vec(),
    };

    let mut record = store.load_sender_key(group_jid, sender_address).await?.unwrap_or_default();
    record.states.push(state);
    store.store_sender_key(group_jid, sender_address, record).await?;

    Ok(skdm)
}

/// Installs a sender-key state received from another device's SKDM.
pub async fn process_distribution_message<S: SignalStore>(
    store: &S,
    sender_address: &str,
    skdm: &SenderKeyDistributionMessage,
) -> Result<(), GroupCipherError> {
    let key_id = u32::from_be_bytes(
        skdm.sender_key_id
            .clone()
            .try_into()
            .map_err(|_| GroupCipherError::NoSenderKey { group: skdm.group_id.clone(), sender: sender_address.to_owned() })?,
    );
    let mut chain_key = [0_u8; 32];
    chain_key.copy_from_slice(&skdm.chain_key);
    let mut signing_public = [0_u8; 32];
    signing_public.copy_from_slice(&skdm.signing_key);

    let state = SenderKeyState {
        key_id,
        iteration: skdm.iteration,
        chain_key,
        signing_key: KeyPair { public: signing_public, private: [0_u8; 32] },
        skipped_keys: Default::default(),
    };

    let mut record = store.load_sender_key(&skdm.group_id, sender_address).await?.unwrap_or_default();
    record.states.retain(|existing| existing.key_id != key_id);
    record.states.push(state);
    store.store_sender_key(&skdm.group_id, sender_address, record).await?;
    Ok(())
}

/// Encrypts `plaintext` under the current (highest-iteration) sender-key
/// state for `(group_jid, sender_address)`, ratcheting the chain by one.
pub async fn encrypt<S: SignalStore>(
    store: &S,
    group_jid: &str,
    sender_address: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>, GroupCipherError> {
    let mut record = store
        .load_sender_key(group_jid, sender_address)
        .await?
        .ok_or_else(|| GroupCipherError::NoSenderKey { group: group_jid.to_owned(), sender: sender_address.to_owned() })?;

    let state = record
        .states
        .last_mut()
        .ok_or_else(|| GroupCipherError::NoSenderKey { group: group_jid.to_owned(), sender: sender_address.to_owned() })?;

    if state.signing_key.private == [0_u8; 32] {
        return Err(GroupCipherError::NoSenderKey { group: group_jid.to_owned(), sender: sender_address.to_owned() });
    }

    let (iv, cipher_key) = derive_message_key(&state.chain_key);
    let iteration = state.iteration;
    state.chain_key = ratchet_chain_key(&state.chain_key);
    state.iteration += 1;

    let ciphertext = cbc_encrypt(&cipher_key, &iv, plaintext);
    let signature = sign_ciphertext(&state.signing_key, state.key_id, iteration, &ciphertext);

    let key_id = state.key_id;
    store.store_sender_key(group_jid, sender_address, record).await?;

    Ok(encode_skmsg(key_id, iteration, &ciphertext, &signature))
}

/// Decrypts a sender-key message, ratcheting forward (and caching skipped
/// keys) or consulting the skipped-key cache as needed.
pub async fn decrypt<S: SignalStore>(
    store: &S,
    group_jid: &str,
    sender_address: &str,
    payload: &[u8],
) -> Result<Vec<u8>, GroupCipherError> {
    let (key_id, iteration, ciphertext, signature) =
        decode_skmsg(payload).ok_or_else(|| GroupCipherError::NoSenderKey { group: group_jid.to_owned(), sender: sender_address.to_owned() })?;

    let mut record = store
        .load_sender_key(group_jid, sender_address)
        .await?
        .ok_or_else(|| GroupCipherError::NoSenderKey { group: group_jid.to_owned(), sender: sender_address.to_owned() })?;

    let state = record
        .states
        .iter_mut()
        .find(|state| state.key_id == key_id)
        .ok_or_else(|| GroupCipherError::NoSenderKey { group: group_jid.to_owned(), sender: sender_address.to_owned() })?;

    if !verify_signature(&state.signing_key, key_id, iteration, ciphertext, signature) {
        return Err(GroupCipherError::BadSignature { group: group_jid.to_owned(), sender: sender_address.to_owned() });
    }

    let (iv, cipher_key) = if iteration < state.iteration {
        let cached = state.skipped_keys.remove(&iteration).ok_or(GroupCipherError::SkippedKeyMissing(iteration))?;
        split_message_key(cached)
    } else {
        let ahead = iteration - state.iteration;
        if ahead > MAX_FORWARD_ITERATIONS {
            return Err(GroupCipherError::IterationTooFarAhead { iteration });
        }

        while state.iteration < iteration {
            let material = derive_key_material(&state.chain_key);
            state.skipped_keys.insert(state.iteration, material);
            state.chain_key = ratchet_chain_key(&state.chain_key);
            state.iteration += 1;
        }

        let material = derive_key_material(&state.chain_key);
        state.chain_key = ratchet_chain_key(&state.chain_key);
        state.iteration += 1;
        split_message_key(material)
    };

    let plaintext =
        cbc_decrypt(&cipher_key, &iv, ciphertext).ok_or_else(|| GroupCipherError::NoSenderKey { group: group_jid.to_owned(), sender: sender_address.to_owned() })?;

    store.store_sender_key(group_jid, sender_address, record).await?;
    Ok(plaintext)
}

/// Records in `sender-key-memory` that `device_jid` has received the
/// current epoch's SKDM for `group_jid`, so later sends don't repeat it.
/// Excludes hosted devices and device 99 per §4.D / Open Question 3.
pub async fn note_skdm_delivered<S: SignalStore>(store: &S, group_jid: &str, epoch: &str, device_jid: &str) -> Result<(), GroupCipherError> {
    if is_excluded_device(device_jid) {
        return Ok(());
    }
    store.mark_received(group_jid, epoch, device_jid).await?;
    Ok(())
}

/// Returns which of `recipient_devices` still need the current epoch's
/// SKDM for `group_jid` (§4.D "sender-key distribution").
pub async fn devices_needing_distribution<S: SignalStore>(
    store: &S,
    group_jid: &str,
    epoch: &str,
    recipient_devices: &[String],
) -> Result<Vec<String>, GroupCipherError> {
    let mut needing = Vec::new();
    for device_jid in recipient_devices {
        if is_excluded_device(device_jid) {
            continue;
        }
        if !store.has_received(group_jid, epoch, device_jid).await? {
            needing.push(device_jid.clone());
        }
    }
    Ok(needing)
}

fn is_excluded_device(device_jid: &str) -> bool {
    device_jid.ends_with(":99") || device_jid.starts_with("99:") || device_jid == "99"
}

fn derive_message_key(chain_key: &[u8; 32]) -> ([u8; 16], [u8; 32]) {
    split_message_key(derive_key_material(chain_key))
}

fn derive_key_material(chain_key: &[u8; 32]) -> [u8; 32] {
    hmac_sha256(chain_key, &[0x01])
}

fn split_message_key(material: [u8; 32]) -> ([u8; 16], [u8; 32]) {
    let hk = hkdf::Hkdf::<Sha256>::new(None, &material);
    let mut output = [0_u8; 48];
    hk.expand(b"wa-md-core-sender-key", &mut output).expect("48-byte expand never fails");
    let mut iv = [0_u8; 16];
    iv.copy_from_slice(&output[..16]);
    let mut cipher_key = [0_u8; 32];
    cipher_key.copy_from_slice(&output[16..]);
    (iv, cipher_key)
}

fn ratchet_chain_key(chain_key: &[u8; 32]) -> [u8; 32] {
    hmac_sha256(chain_key, &[0x02])
}

fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let mut out = [0_u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn sign_ciphertext(signing_key: &KeyPair, key_id: u32, iteration: u32, ciphertext: &[u8]) -> [u8; 64] {
    let message = sign_input(key_id, iteration, ciphertext);
    crate::keys::sign_message(signing_key.private, signing_key.public, &message)
}

fn verify_signature(signing_key: &KeyPair, key_id: u32, iteration: u32, ciphertext: &[u8], signature: &[u8]) -> bool {
    let message = sign_input(key_id, iteration, ciphertext);
    crate::keys::verify_message(signing_key.public, &message, signature)
}

fn sign_input(key_id: u32, iteration: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + ciphertext.len());
    message.extend_from_slice(&key_id.to_be_bytes());
    message.extend_from_slice(&iteration.to_be_bytes());
    message.extend_from_slice(ciphertext);
    message
}

fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Option<Vec<u8>> {
    Aes256CbcDec::new(key.into(), iv.into()).decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()
}

fn encode_skmsg(key_id: u32, iteration: u32, ciphertext: &[u8], signature: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + 64 + ciphertext.len());
    out.extend_from_slice(&key_id.to_be_bytes());
    out.extend_from_slice(&iteration.to_be_bytes());
    out.extend_from_slice(signature);
    out.extend_from_slice(ciphertext);
    out
}

fn decode_skmsg(payload: &[u8]) -> Option<(u32, u32, &[u8], &[u8])> {
    if payload.len() < 4 + 4 + 64 {
        return None;
    }
    let key_id = u32::from_be_bytes(payload[0..4].try_into().ok()?);
    let iteration = u32::from_be_bytes(payload[4..8].try_into().ok()?);
    let signature = &payload[8..72];
    let ciphertext = &payload[72..];
    Some((key_id, iteration, ciphertext, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySignalStore;

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip_for_originating_device() {
        let store = InMemorySignalStore::new();
        create_sender_key(&store, "group@g.us", "alice.1").await.unwrap();

        let ciphertext = encrypt(&store, "group@g.us", "alice.1", b"hello group").await.unwrap();
        let plaintext = decrypt(&store, "group@g.us", "alice.1", &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"hello group");
    }

    #[tokio::test]
    async fn recipient_installs_distribution_message_and_decrypts() {
        let sender_store = InMemorySignalStore::new();
        let skdm = create_sender_key(&sender_store, "group@g.us", "alice.1").await.unwrap();
        let ciphertext = encrypt(&sender_store, "group@g.us", "alice.1", b"to the group").await.unwrap();

        let recipient_store = InMemorySignalStore::new();
        process_distribution_message(&recipient_store, "alice.1", &skdm).await.unwrap();
        let plaintext = decrypt(&recipient_store, "group@g.us", "alice.1", &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"to the group");
    }

    #[tokio::test]
    async fn out_of_order_message_uses_skipped_key_cache() {
        let store = InMemorySignalStore::new();
        let skdm = create_sender_key(&store, "group@g.us", "alice.1").await.unwrap();

        let recipient_store = InMemorySignalStore::new();
        process_distribution_message(&recipient_store, "alice.1", &skdm).await.unwrap();

        let first = encrypt(&store, "group@g.us", "alice.1", b"one").await.unwrap();
        let second = encrypt(&store, "group@g.us", "alice.1", b"two").await.unwrap();

        let plaintext_second = decrypt(&recipient_store, "group@g.us", "alice.1", &second).await.unwrap();
        assert_eq!(plaintext_second, b"two");
        let plaintext_first = decrypt(&recipient_store, "group@g.us", "alice.1", &first).await.unwrap();
        assert_eq!(plaintext_first, b"one");
    }

    #[tokio::test]
    async fn excluded_device_99_never_recorded_or_listed() {
        let store = InMemorySignalStore::new();
        note_skdm_delivered(&store, "group@g.us", "epoch-1", "12345:99").await.unwrap();
        let needing = devices_needing_distribution(&store, "group@g.us", "epoch-1", &["12345:99".to_owned(), "999:1".to_owned()])
            .await
            .unwrap();
        assert_eq!(needing, vec!["999:1".to_owned()]);
    }
}
