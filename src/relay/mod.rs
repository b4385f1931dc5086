//! Fan-out relay (§4.G): the single entry point for outbound messages.
//! Branches by destination server, resolves recipients via the device
//! resolver, and produces a wire-ready [`BinaryNode`].

use std::collections::HashMap;

use prost::Message as _;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::binary_node::{BinaryNode, NodeContent};
use crate::device::{DeviceResolver, PreKeyFetcher, UsyncClient};
use crate::error::{RelayError, SessionError};
use crate::keys::KeyPair;
use crate::prekey::{PreKeyManager, PreKeyServer, Priority};
use crate::session::MessageType;
use crate::store::SignalStore;

/// Content-derived wire `type` attribute (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Media,
    Poll,
    Reaction,
    Event,
}

impl MessageKind {
    fn as_attr(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Media => "media",
            Self::Poll => "poll",
            Self::Reaction => "reaction",
            Self::Event => "event",
        }
    }

    /// Pin/keep/reaction/edit messages suppress decrypt-failure reporting
    /// (§4.G "Wire stanza attributes").
    fn hides_decrypt_failure(self) -> bool {
        matches!(self, Self::Reaction)
    }
}

/// `edit` attribute values named in §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Edit,
    Pin,
    Delete,
    DeleteForMe,
}

impl EditKind {
    fn as_attr(self) -> &'static str {
        match self {
            Self::Edit => "1",
            Self::Pin => "2",
            Self::Delete => "7",
            Self::DeleteForMe => "8",
        }
    }

    fn hides_decrypt_failure(self) -> bool {
        matches!(self, Self::Pin | Self::Delete | Self::DeleteForMe)
    }
}

/// Retry-resend mode: encrypt for exactly one recipient, don't update
/// sender-key-memory.
#[derive(Debug, Clone)]
pub struct RetryResend {
    pub participant: String,
    pub count: u32,
}

#[derive(Debug, Default, Clone)]
pub struct SendOptions {
    pub retry_resend: Option<RetryResend>,
    pub extra_attrs: HashMap<String, String>,
    pub status_jid_list: Option<Vec<String>>,
    pub cached_group_metadata: bool,
    pub edit: Option<EditKind>,
}

pub struct SendRequest<'a> {
    pub destination: &'a str,
    pub message_plaintext: &'a [u8],
    pub message_id: Option<String>,
    pub kind: MessageKind,
    pub mediatype: Option<&'a str>,
    pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message_id: String,
    pub node: BinaryNode,
}

/// Either a single message shared by every recipient, or a per-recipient
/// mapping. Groups only accept the former (§4.G "Patching hook").
pub enum PatchOutcome {
    Same(Vec<u8>),
    PerRecipient(HashMap<String, Vec<u8>>),
}

/// Caller hook run before encryption; lets higher layers rewrite content
/// per destination.
pub trait MessagePatcher: Send + Sync {
    fn patch(&self, message: &[u8], recipients: &[String]) -> PatchOutcome;
}

/// No-op patcher: every recipient gets the same bytes.
pub struct IdentityPatcher;

impl MessagePatcher for IdentityPatcher {
    fn patch(&self, message: &[u8], _recipients: &[String]) -> PatchOutcome {
        PatchOutcome::Same(message.to_vec())
    }
}

/// Resolves a group's participant list, from cache when available.
#[async_trait::async_trait]
pub trait GroupMetadataSource: Send + Sync {
    async fn participants(&self, group_jid: &str, use_cache: bool) -> Result<Vec<String>, RelayError>;
}

pub struct Relay {
    device_resolver: DeviceResolver,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self { device_resolver: DeviceResolver::new() }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send<S, U, F, P, G>(
        &self,
        store: &S,
        usync: &U,
        prekey_fetcher: &F,
        patcher: &P,
        group_metadata: &G,
        own_user: &str,
        own_sender_address: &str,
        local_identity: KeyPair,
        request: SendRequest<'_>,
    ) -> Result<SendOutcome, RelayError>
    where
        S: SignalStore,
        U: UsyncClient,
        F: PreKeyFetcher,
        P: MessagePatcher,
        G: GroupMetadataSource,
    {
        let message_id = request.message_id.clone().unwrap_or_else(generate_message_id);
        let server = request.destination.rsplit_once('@').map(|(_, server)| server).ok_or_else(|| RelayError::InvalidDestination(request.destination.to_owned()))?;

        let node = match server {
            "newsletter" => self.send_newsletter(&message_id, &request),
            "g.us" | "status@broadcast" | "broadcast" => {
                self.send_group(store, usync, prekey_fetcher, patcher, group_metadata, own_sender_address, local_identity, &message_id, &request).await?
            }
            "s.whatsapp.net" | "lid" => self.send_one_to_one(store, usync, prekey_fetcher, patcher, own_user, local_identity, &message_id, &request).await?,
            other => return Err(RelayError::InvalidDestination(other.to_owned())),
        };

        Ok(SendOutcome { message_id, node })
    }

    fn send_newsletter(&self, message_id: &str, request: &SendRequest<'_>) -> BinaryNode {
        let mut attrs = base_attrs(message_id, request);
        attrs.insert("to".to_owned(), request.destination.to_owned());
        BinaryNode {
            tag: "message".to_owned(),
            attrs,
            content: NodeContent::Nodes(vec![BinaryNode {
                tag: "plaintext".to_owned(),
                attrs: HashMap::new(),
                content: NodeContent::Bytes(bytes::Bytes::copy_from_slice(request.message_plaintext)),
            }]),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_group<S, U, F, P, G>(
        &self,
        store: &S,
        usync: &U,
        prekey_fetcher: &F,
        patcher: &P,
        group_metadata: &G,
        own_sender_address: &str,
        local_identity: KeyPair,
        message_id: &str,
        request: &SendRequest<'_>,
    ) -> Result<BinaryNode, RelayError>
    where
        S: SignalStore,
        U: UsyncClient,
        F: PreKeyFetcher,
        P: MessagePatcher,
        G: GroupMetadataSource,
    {
        let mut participants = group_metadata.participants(request.destination, request.options.cached_group_metadata).await?;
        if let Some(retry) = &request.options.retry_resend {
            participants = vec![retry.participant.clone()];
        }

        if matches!(patcher.patch(request.message_plaintext, &participants), PatchOutcome::PerRecipient(_)) {
            return Err(RelayError::PerRecipientPatchInGroup);
        }

        let destinations = self.device_resolver.resolve(store, usync, &participants).await?;
        let recipient_jids: Vec<String> = destinations.iter().map(|dest| dest.jid.clone()).collect();
        self.device_resolver.assert_sessions(store, prekey_fetcher, &recipient_jids, false, local_identity).await?;

        let epoch = crate::group::create_sender_key(store, request.destination, own_sender_address).await?;
        let epoch_id = String::from_utf8_lossy(&epoch.sender_key_id).into_owned();

        let needing_skdm = if request.options.retry_resend.is_some() {
            recipient_jids.clone()
        } else {
            crate::group::devices_needing_distribution(store, request.destination, &epoch_id, &recipient_jids).await?
        };

        let mut to_nodes = Vec::with_capacity(needing_skdm.len());
        let mut any_pkmsg = false;
        for recipient in &needing_skdm {
            let skdm_bytes = epoch.encode_to_vec();
            let (message_type, ciphertext) = crate::session::encrypt(store, recipient, &skdm_bytes).await?;
            any_pkmsg |= message_type == MessageType::PreKey;
            to_nodes.push(enc_child_node(recipient, message_type, &ciphertext));
            if request.options.retry_resend.is_none() {
                crate::group::note_skdm_delivered(store, request.destination, &epoch_id, recipient).await?;
            }
        }

        let group_ciphertext = crate::group::encrypt(store, request.destination, own_sender_address, request.message_plaintext).await?;

        let mut attrs = base_attrs(message_id, request);
        attrs.insert("to".to_owned(), request.destination.to_owned());
        attrs.insert("addressing_mode".to_owned(), "pn".to_owned());
        if let Some(count) = request.options.retry_resend.as_ref().map(|retry| retry.count) {
            attrs.insert("count".to_owned(), count.to_string());
        }
        if let Some(status_jids) = &request.options.status_jid_list {
            attrs.insert("statusJidList".to_owned(), status_jids.join(","));
        }

        let mut children = to_nodes;
        children.push(BinaryNode {
            tag: "enc".to_owned(),
            attrs: HashMap::from([("type".to_owned(), "skmsg".to_owned())]),
            content: NodeContent::Bytes(bytes::Bytes::copy_from_slice(&group_ciphertext)),
        });
        if any_pkmsg {
            children.push(device_identity_node(local_identity));
        }

        Ok(BinaryNode { tag: "message".to_owned(), attrs, content: NodeContent::Nodes(children) })
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_one_to_one<S, U, F, P>(
        &self,
        store: &S,
        usync: &U,
        prekey_fetcher: &F,
        patcher: &P,
        own_user: &str,
        local_identity: KeyPair,
        message_id: &str,
        request: &SendRequest<'_>,
    ) -> Result<BinaryNode, RelayError>
    where
        S: SignalStore,
        U: UsyncClient,
        F: PreKeyFetcher,
        P: MessagePatcher,
    {
        let target_users = vec![request.destination.rsplit_once('@').map(|(user, _)| user.to_owned()).unwrap_or_default(), own_user.to_owned()];
        let destinations = self.device_resolver.resolve(store, usync, &target_users).await?;
        let recipient_jids: Vec<String> = destinations.iter().map(|dest| dest.jid.clone()).collect();
        self.device_resolver.assert_sessions(store, prekey_fetcher, &recipient_jids, false, local_identity).await?;

        let per_recipient = match patcher.patch(request.message_plaintext, &recipient_jids) {
            PatchOutcome::Same(bytes) => destinations.iter().map(|dest| (dest.clone(), bytes.clone())).collect::<Vec<_>>(),
            PatchOutcome::PerRecipient(mapping) => destinations
                .iter()
                .map(|dest| {
                    let bytes = mapping.get(&dest.jid).cloned().unwrap_or_else(|| request.message_plaintext.to_vec());
                    (dest.clone(), bytes)
                })
                .collect(),
        };

        // NOTE: recipients in `own_user`'s device set receive the same
        // plaintext as everyone else here; a DSM (device-sent-message)
        // wrapper distinguishing "sent to my other device" from "sent to
        // the peer" is a protocol-level content concern the caller owns
        // (it supplies `message_plaintext` already built), not something
        // this relay layer encodes itself.
        let mut to_nodes = Vec::with_capacity(per_recipient.len());
        let mut any_pkmsg = false;
        for (dest, plaintext) in &per_recipient {
            let (message_type, ciphertext) = crate::session::encrypt(store, &dest.jid, plaintext).await?;
            any_pkmsg |= message_type == MessageType::PreKey;
            to_nodes.push(enc_child_node(&dest.jid, message_type, &ciphertext));
        }

        let participant_hash = compute_participant_hash(&recipient_jids);

        let mut attrs = base_attrs(message_id, request);
        attrs.insert("to".to_owned(), request.destination.to_owned());
        attrs.insert("phash".to_owned(), participant_hash);

        let mut children = to_nodes;
        if any_pkmsg {
            children.push(device_identity_node(local_identity));
        }

        Ok(BinaryNode { tag: "message".to_owned(), attrs, content: NodeContent::Nodes(children) })
    }

    /// Decrypts an inbound 1:1 `enc` payload. A bad-MAC/corrupt session is
    /// recoverable crypto (§7 scenario S4): it is never retried, but it
    /// invalidates the cached session-exists flag so the next send re-runs
    /// `assertSessions(force=true)`, and it triggers a critical pre-key
    /// audit in case the local signed pre-key itself has gone stale. The
    /// original error is always returned to the caller unchanged.
    pub async fn receive_one_to_one<S, Srv>(
        &self,
        store: &S,
        server: &Srv,
        prekey_manager: &PreKeyManager,
        sender_address: &str,
        message_type: MessageType,
        ciphertext: &[u8],
        local_identity: KeyPair,
        on_creds_update: impl Fn() + Send + Sync,
    ) -> Result<Vec<u8>, RelayError>
    where
        S: SignalStore,
        Srv: PreKeyServer,
    {
        let result = crate::session::decrypt(store, sender_address, message_type, ciphertext, local_identity).await;

        if let Err(error @ (SessionError::BadMac(_) | SessionError::Corrupt(_, _))) = &result {
            tracing::warn!(address = sender_address, %error, "bad MAC/corrupt session on inbound message, triggering pre-key audit");
            self.device_resolver.invalidate_session(sender_address).await;
            if let Err(audit_error) = prekey_manager.request_check(store, server, Priority::Critical, on_creds_update).await {
                tracing::warn!(address = sender_address, error = %audit_error, "critical pre-key audit after bad MAC failed");
            }
        }

        Ok(result?)
    }
}

fn base_attrs(message_id: &str, request: &SendRequest<'_>) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    attrs.insert("id".to_owned(), message_id.to_owned());
    attrs.insert("type".to_owned(), request.kind.as_attr().to_owned());
    if let Some(mediatype) = request.mediatype {
        attrs.insert("mediatype".to_owned(), mediatype.to_owned());
    }
    if let Some(edit) = request.options.edit {
        attrs.insert("edit".to_owned(), edit.as_attr().to_owned());
        if edit.hides_decrypt_failure() || request.kind.hides_decrypt_failure() {
            attrs.insert("decrypt-fail".to_owned(), "hide".to_owned());
        }
    } else if request.kind.hides_decrypt_failure() {
        attrs.insert("decrypt-fail".to_owned(), "hide".to_owned());
    }
    for (key, value) in &request.options.extra_attrs {
        attrs.insert(key.clone(), value.clone());
    }
    attrs
}

fn enc_child_node(to_jid: &str, message_type: MessageType, ciphertext: &[u8]) -> BinaryNode {
    let enc_type = match message_type {
        MessageType::PreKey => "pkmsg",
        MessageType::Normal => "msg",
    };
    BinaryNode {
        tag: "to".to_owned(),
        attrs: HashMap::from([("jid".to_owned(), to_jid.to_owned())]),
        content: NodeContent::Nodes(vec![BinaryNode {
            tag: "enc".to_owned(),
            attrs: HashMap::from([("type".to_owned(), enc_type.to_owned())]),
            content: NodeContent::Bytes(bytes::Bytes::copy_from_slice(ciphertext)),
        }]),
    }
}

fn device_identity_node(local_identity: KeyPair) -> BinaryNode {
    BinaryNode {
        tag: "device-identity".to_owned(),
        attrs: HashMap::new(),
        content: NodeContent::Bytes(bytes::Bytes::copy_from_slice(&local_identity.public)),
    }
}

fn compute_participant_hash(recipient_jids: &[String]) -> String {
    let mut sorted = recipient_jids.to_vec();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for jid in &sorted {
        hasher.update(jid.as_bytes());
    }
    let digest = hasher.finalize();
    format!("2:{}", hex::encode(&digest[..6]))
}

fn generate_message_id() -> String {
    let mut raw = [0_u8; 8];
    OsRng.fill_bytes(&mut raw);
    format!("{:016X}", u64::from_be_bytes(raw))
}

