//! Auth & pairing (§4.J): QR bootstrap, pairing-code bootstrap, and the
//! `configureSuccessfulPairing` validation that turns a server `pair-success`
//! stanza into confirmed credentials.

use std::collections::VecDeque;
use std::time::Duration;

use aes::Aes256;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AuthError;
use crate::keys::{KeyPair, generate_keypair, generate_registration_id, sign_message, verify_message};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Browser identity advertised during pairing and registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserMetadata {
    pub name: String,
    pub os: String,
    pub version: String,
}

impl Default for BrowserMetadata {
    fn default() -> Self {
        Self { name: "wa-md-core".to_owned(), os: "Linux".to_owned(), version: "1.0.0".to_owned() }
    }
}

/// Account information available once `me` is known from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeInfo {
    pub jid: String,
    pub push_name: Option<String>,
}

/// Session metadata that fills in as pairing and registration progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionMetadata {
    pub me: Option<MeInfo>,
    /// Opaque routing hint the server attaches to `pair-success`; echoed
    /// back on reconnect so the edge can route to the same backend.
    pub routing_info: Option<Vec<u8>>,
    pub browser: BrowserMetadata,
    pub country_code: Option<String>,
}

/// Identity and pre-key material persisted per instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityState {
    /// Static identity key used by Signal-compatible flows.
    pub identity_key: KeyPair,
    /// Registration identifier (14-bit, widened to 16) for the account.
    pub registration_id: u32,
    /// Signed pre-key pair.
    pub signed_pre_key: KeyPair,
    #[serde(with = "serde_sig64")]
    pub signed_pre_key_sig: [u8; 64],
    /// One-time pre-keys consumed during session bootstrap.
    pub one_time_pre_keys: Vec<KeyPair>,
    /// Static Noise key, distinct from the Signal identity key: it
    /// authenticates the transport handshake, not message content.
    pub noise_key: KeyPair,
    /// Secret used to sign/verify the advertised device identity during
    /// pairing (`configureSuccessfulPairing`).
    pub adv_secret_key: [u8; 32],
}

/// Full auth state persisted for each instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub identity: IdentityState,
    pub metadata: SessionMetadata,
    pub registered: bool,
}

impl AuthState {
    pub fn new() -> Self {
        let mut signed_pre_key_sig = [0_u8; 64];
        OsRng.fill_bytes(&mut signed_pre_key_sig);
        let mut adv_secret_key = [0_u8; 32];
        OsRng.fill_bytes(&mut adv_secret_key);

        let one_time_pre_keys = (0..16).map(|_| generate_keypair()).collect();

        Self {
            identity: IdentityState {
                identity_key: generate_keypair(),
                registration_id: generate_registration_id(),
                signed_pre_key: generate_keypair(),
                signed_pre_key_sig,
                one_time_pre_keys,
                noise_key: generate_keypair(),
                adv_secret_key,
            },
            metadata: SessionMetadata::default(),
            registered: false,
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

mod serde_sig64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as DeError};

    pub fn serialize<S>(value: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        if bytes.len() != 64 {
            return Err(D::Error::invalid_length(bytes.len(), &"64 bytes"));
        }
        let mut out = [0_u8; 64];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// Rotation interval for the first ref, then every ref after it (§5
/// Timeouts: "QR rotation = 60 s → 20 s").
const QR_FIRST_ROTATION: Duration = Duration::from_secs(60);
const QR_SUBSEQUENT_ROTATION: Duration = Duration::from_secs(20);

/// Tracks the pool of `<ref>` tokens the server hands out in the
/// `pair-device` stanza and emits one `connection.update{qr}` payload per
/// ref on a timer, per §4.J.
pub struct QrPairingSession {
    refs: VecDeque<String>,
    consumed: u32,
}

impl QrPairingSession {
    pub fn new(refs: Vec<String>) -> Self {
        Self { refs: refs.into(), consumed: 0 }
    }

    /// Consumes the next ref and builds its QR payload string, or `None`
    /// once the pool is exhausted (the server is expected to send more).
    pub fn next_payload(&mut self, noise_pub: &[u8; 32], identity_pub: &[u8; 32], adv_secret: &[u8; 32]) -> Option<String> {
        let next_ref = self.refs.pop_front()?;
        self.consumed += 1;

        let engine = base64::engine::general_purpose::STANDARD;
        Some(format!("{next_ref},{},{},{}", engine.encode(noise_pub), engine.encode(identity_pub), engine.encode(adv_secret)))
    }

    /// How long to wait before consuming the next ref: 60s for the very
    /// first one, 20s for every one after.
    pub fn rotation_interval(&self) -> Duration {
        if self.consumed <= 1 { QR_FIRST_ROTATION } else { QR_SUBSEQUENT_ROTATION }
    }

    pub fn is_exhausted(&self) -> bool {
        self.refs.is_empty()
    }
}

/// The device identity bundle advertised by the phone on `pair-success`,
/// signed over two layers: the phone's account key signs the device's
/// identity key, and the device counter-signs to confirm receipt.
#[derive(Debug, Clone)]
pub struct AdvertisedDeviceIdentity {
    pub details: Vec<u8>,
    pub account_signature_key: [u8; 32],
    pub account_signature: [u8; 64],
    pub device_signature: [u8; 64],
}

/// Extracted identity once `configureSuccessfulPairing` validates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSuccessResult {
    pub phone_id: String,
    pub platform: String,
}

const ACCOUNT_SIGNATURE_HEADER: u8 = 0x06;
const DEVICE_SIGNATURE_HEADER: u8 = 0x06;

fn account_signature_input(details: &[u8], identity_pub: &[u8; 32]) -> Vec<u8> {
    let mut input = Vec::with_capacity(1 + details.len() + 32);
    input.push(ACCOUNT_SIGNATURE_HEADER);
    input.extend_from_slice(details);
    input.extend_from_slice(identity_pub);
    input
}

fn device_signature_input(details: &[u8], identity_pub: &[u8; 32], account_signature_key: &[u8; 32]) -> Vec<u8> {
    let mut input = Vec::with_capacity(1 + details.len() + 64);
    input.push(DEVICE_SIGNATURE_HEADER);
    input.extend_from_slice(details);
    input.extend_from_slice(identity_pub);
    input.extend_from_slice(account_signature_key);
    input
}

/// Validates the advertised device identity's dual signatures and
/// extracts the phone id + platform from `details` (expected to be
/// `"{phone_id}:{platform}"`, the minimal shape the relay needs).
pub fn configure_successful_pairing(
    identity: &IdentityState,
    advertised: &AdvertisedDeviceIdentity,
) -> Result<PairSuccessResult, AuthError> {
    let account_input = account_signature_input(&advertised.details, &identity.identity_key.public);
    if !verify_message(&advertised.account_signature_key, &account_input, &advertised.account_signature) {
        return Err(AuthError::InvalidDeviceIdentity);
    }

    let device_input = device_signature_input(&advertised.details, &identity.identity_key.public, &advertised.account_signature_key);
    if !verify_message(&identity.identity_key.public, &device_input, &advertised.device_signature) {
        return Err(AuthError::InvalidDeviceIdentity);
    }

    let details = std::str::from_utf8(&advertised.details).map_err(|_| AuthError::InvalidDeviceIdentity)?;
    let (phone_id, platform) = details.split_once(':').ok_or(AuthError::InvalidDeviceIdentity)?;

    Ok(PairSuccessResult { phone_id: phone_id.to_owned(), platform: platform.to_owned() })
}

/// Counter-signs our own identity as the device side of the pairing
/// handshake (the inverse of [`configure_successful_pairing`]'s second
/// check), for building the outgoing `pair-device` reply.
pub fn sign_device_identity(identity: &IdentityState, details: &[u8], account_signature_key: &[u8; 32]) -> [u8; 64] {
    let input = device_signature_input(details, &identity.identity_key.public, account_signature_key);
    sign_message(&identity.identity_key.private, &identity.identity_key.public, &input)
}

/// Crockford base32 alphabet excludes easily-confused characters (I, L,
/// O, U), matching the 8-character pairing codes WhatsApp displays.
pub fn generate_pairing_code() -> String {
    let mut raw = [0_u8; 5];
    OsRng.fill_bytes(&mut raw);
    let encoded = base32::encode(base32::Alphabet::Crockford, &raw);
    encoded.chars().take(8).collect::<String>().to_uppercase()
}

/// Validates a caller-supplied pairing code: exactly 8 characters.
pub fn validate_pairing_code(code: &str) -> Result<String, AuthError> {
    if code.chars().count() != 8 {
        return Err(AuthError::InvalidPairingCodeLength(code.chars().count()));
    }
    Ok(code.to_uppercase())
}

/// Derives the symmetric key used to encrypt the pairing ephemeral public
/// key, keyed on the displayed code and a random salt.
pub fn derive_pairing_key(code: &str, salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), code.as_bytes());
    let mut okm = [0_u8; 32];
    hk.expand(b"wa-md-core-pairing-code", &mut okm).expect("32-byte okm fits HKDF-SHA256 output");
    okm
}

/// AES-CTR-encrypts the pairing ephemeral public key under the derived
/// pairing key, for the `companion_hello` stage payload.
pub fn encrypt_pairing_ephemeral_key(pairing_key: &[u8; 32], iv: &[u8; 16], ephemeral_pub: &[u8; 32]) -> Vec<u8> {
    let mut buf = ephemeral_pub.to_vec();
    let mut cipher = Aes256Ctr::new(pairing_key.into(), iv.into());
    cipher.apply_keystream(&mut buf);
    buf
}

/// One full pairing-code attempt: the generated/validated code, a fresh
/// ephemeral key pair, and the IV used to encrypt it.
pub struct PairingCodeSession {
    pub code: String,
    pub ephemeral: KeyPair,
    pub iv: [u8; 16],
}

impl PairingCodeSession {
    pub fn new(caller_code: Option<&str>) -> Result<Self, AuthError> {
        let code = match caller_code {
            Some(supplied) => validate_pairing_code(supplied)?,
            None => generate_pairing_code(),
        };
        let mut iv = [0_u8; 16];
        OsRng.fill_bytes(&mut iv);
        Ok(Self { code, ephemeral: generate_keypair(), iv })
    }

    /// Builds the attrs for the outgoing `companion_hello` IQ.
    pub fn companion_hello_attrs(&self, pairing_key_salt: &[u8], platform: &str) -> std::collections::HashMap<String, String> {
        let pairing_key = derive_pairing_key(&self.code, pairing_key_salt);
        let encrypted = encrypt_pairing_ephemeral_key(&pairing_key, &self.iv, &self.ephemeral.public);

        let mut attrs = std::collections::HashMap::new();
        attrs.insert("stage".to_owned(), "companion_hello".to_owned());
        attrs.insert("platform".to_owned(), platform.to_owned());
        attrs.insert("iv".to_owned(), hex::encode(self.iv));
        attrs.insert("ephemeral".to_owned(), hex::encode(encrypted));
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_session_rotates_from_60s_to_20s() {
        let mut session = QrPairingSession::new(vec!["R1".to_owned(), "R2".to_owned()]);
        let noise = generate_keypair();
        let identity = generate_keypair();
        let adv = [7_u8; 32];

        let first = session.next_payload(&noise.public, &identity.public, &adv).unwrap();
        assert!(first.starts_with("R1,"));
        assert_eq!(session.rotation_interval(), QR_FIRST_ROTATION);

        let second = session.next_payload(&noise.public, &identity.public, &adv).unwrap();
        assert!(second.starts_with("R2,"));
        assert_eq!(session.rotation_interval(), QR_SUBSEQUENT_ROTATION);
        assert!(session.is_exhausted());
    }

    #[test]
    fn pairing_roundtrip_signatures_validate() {
        let identity = IdentityState {
            identity_key: generate_keypair(),
            registration_id: generate_registration_id(),
            signed_pre_key: generate_keypair(),
            signed_pre_key_sig: [0_u8; 64],
            one_time_pre_keys: vec![],
            noise_key: generate_keypair(),
            adv_secret_key: [0_u8; 32],
        };
        let account_key = generate_keypair();
        let details = b"16505551234:android".to_vec();

        let account_signature = sign_message(&account_key.private, &account_key.public, &account_signature_input(&details, &identity.identity_key.public));
        let device_signature = sign_device_identity(&identity, &details, &account_key.public);

        let advertised = AdvertisedDeviceIdentity {
            details,
            account_signature_key: account_key.public,
            account_signature,
            device_signature,
        };

        let result = configure_successful_pairing(&identity, &advertised).unwrap();
        assert_eq!(result, PairSuccessResult { phone_id: "16505551234".to_owned(), platform: "android".to_owned() });
    }

    #[test]
    fn tampered_account_signature_is_rejected() {
        let identity = IdentityState {
            identity_key: generate_keypair(),
            registration_id: generate_registration_id(),
            signed_pre_key: generate_keypair(),
            signed_pre_key_sig: [0_u8; 64],
            one_time_pre_keys: vec![],
            noise_key: generate_keypair(),
            adv_secret_key: [0_u8; 32],
        };
        let account_key = generate_keypair();
        let details = b"16505551234:android".to_vec();
        let device_signature = sign_device_identity(&identity, &details, &account_key.public);

        let advertised = AdvertisedDeviceIdentity {
            details,
            account_signature_key: account_key.public,
            account_signature: [9_u8; 64],
            device_signature,
        };

        assert!(matches!(configure_successful_pairing(&identity, &advertised), Err(AuthError::InvalidDeviceIdentity)));
    }

    #[test]
    fn pairing_code_must_be_eight_chars() {
        assert!(validate_pairing_code("SHORT").is_err());
        assert!(validate_pairing_code("abcd1234").is_ok());
    }

    #[test]
    fn generated_pairing_code_is_eight_uppercase_chars() {
        let code = generate_pairing_code();
        assert_eq!(code.chars().count(), 8);
        assert_eq!(code, code.to_uppercase());
    }
}
