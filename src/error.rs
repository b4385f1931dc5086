use thiserror::Error;

/// Phase in which a handshake-related failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Building or sending the client hello.
    ClientHello,
    /// Processing the server hello (DH, static decrypt, cert verify).
    ServerHello,
    /// Building the client finish message.
    ClientFinish,
    /// After `finish_init`, still inside the bootstrap flow.
    PostFinish,
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ClientHello => "client_hello",
            Self::ServerHello => "server_hello",
            Self::ClientFinish => "client_finish",
            Self::PostFinish => "post_finish",
        };
        f.write_str(label)
    }
}

/// Errors for Noise transport operations.
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("cipher error")]
    Cipher,
    #[error("invalid key material")]
    InvalidKeyMaterial,
    #[error("certificate chain verification failed")]
    CertChainInvalid,
    #[error("frame received before handshake finished")]
    NotTransportReady,
}

/// Errors for the Noise XX handshake, tagged with the phase they occurred in.
#[derive(Debug, Error)]
#[error("handshake failed in {phase}: {message}")]
pub struct HandshakeError {
    /// Phase the failure occurred in.
    pub phase: HandshakePhase,
    /// Human-readable detail.
    pub message: String,
    /// Underlying cause, when one exists.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HandshakeError {
    /// Builds a handshake error tagged with the phase it was raised in.
    pub fn with_phase(phase: HandshakePhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            source: None,
        }
    }

    /// Builds a handshake error wrapping an underlying cause.
    pub fn with_source(
        phase: HandshakePhase,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            phase,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<NoiseError> for HandshakeError {
    fn from(error: NoiseError) -> Self {
        Self::with_source(HandshakePhase::ServerHello, "noise cipher failure", error)
    }
}

impl From<prost::DecodeError> for HandshakeError {
    fn from(error: prost::DecodeError) -> Self {
        Self::with_source(HandshakePhase::ServerHello, "handshake proto decode failed", error)
    }
}

impl From<prost::EncodeError> for HandshakeError {
    fn from(error: prost::EncodeError) -> Self {
        Self::with_source(HandshakePhase::ClientHello, "handshake proto encode failed", error)
    }
}

/// Errors for the binary-node codec.
#[derive(Debug, Error)]
pub enum BinaryNodeError {
    #[error("unexpected end of payload")]
    UnexpectedEof,
    #[error("invalid symbol type: {0}")]
    InvalidSymbolType(u8),
    #[error("invalid content type: {0}")]
    InvalidContentType(u8),
    #[error("invalid utf-8 symbol")]
    InvalidUtf8,
    #[error("unknown token index: {0}")]
    UnknownToken(u8),
    #[error("symbol exceeds u16 max length")]
    SymbolTooLong,
    #[error("payload exceeds u32 max length")]
    PayloadTooLarge,
    #[error("too many attributes for a single node")]
    TooManyAttributes,
    #[error("too many nested child nodes")]
    TooManyChildren,
    #[error("trailing bytes after node decode")]
    TrailingBytes,
    #[error("attribute lookup failed during encode")]
    AttributeLookupFailed,
}

/// Errors for the Signal Store KV contract.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store poisoned: {0}")]
    Poisoned(&'static str),
    #[error("transaction retry budget exhausted for key {0}")]
    TransactionRetriesExhausted(String),
    #[error("missing required index: {0}")]
    MissingIndex(&'static str),
    #[error("missing pre-key at id {0}")]
    MissingCurrentPreKey(u32),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors for the 1:1 double-ratchet session cipher.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no open session for address {0}")]
    NoSession(String),
    #[error("bad MAC on incoming ciphertext for {0}")]
    BadMac(String),
    #[error("session corrupt for {0}: {1}")]
    Corrupt(String, String),
    #[error("pre-key bundle missing signed pre-key signature")]
    InvalidBundle,
    #[error("counter exhausted at u32::MAX for {0}")]
    CounterExhausted(String),
}

/// Errors for the group sender-key cipher.
#[derive(Debug, Error)]
pub enum GroupCipherError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no sender-key record for group {group} sender {sender}")]
    NoSenderKey { group: String, sender: String },
    #[error("signature verification failed for {group}/{sender}")]
    BadSignature { group: String, sender: String },
    #[error("message iteration {iteration} is too far ahead of chain (> 2000)")]
    IterationTooFarAhead { iteration: u32 },
    #[error("skipped message key for iteration {0} not found")]
    SkippedKeyMissing(u32),
}

/// Errors for pre-key inventory management.
#[derive(Debug, Error)]
pub enum PreKeyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upload already in flight")]
    UploadInProgress,
    #[error("upload failed after {0} attempts")]
    UploadExhausted(u32),
}

/// Errors for device/LID resolution.
#[derive(Debug, Error)]
pub enum DeviceResolverError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("lid mapping already exists for pn user {pn_user} with a different lid")]
    LidMappingConflict { pn_user: String },
    #[error("usync query failed: {0}")]
    UsyncFailed(String),
}

/// Errors for the fan-out relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Group(#[from] GroupCipherError),
    #[error(transparent)]
    Device(#[from] DeviceResolverError),
    #[error("per-recipient patch rejected: groups require a single patched message")]
    PerRecipientPatchInGroup,
    #[error("invalid destination jid: {0}")]
    InvalidDestination(String),
}

/// Errors for connection-supervisor-level I/O.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid framed payload: {0}")]
    InvalidFrame(&'static str),
    #[error("payload exceeds max 24-bit frame size")]
    FrameTooLarge,
    #[error("transport closed by peer")]
    Closed,
}

/// Errors for the connection supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("query timed out waiting for tag {0}")]
    QueryTimedOut(String),
    #[error("rate limited past retry budget")]
    RateLimited,
    #[error("connection lost after {0} keep-alive failures")]
    ConnectionLost(u32),
    #[error("reconnect attempts exhausted ({0})")]
    ReconnectFailed(u32),
}

/// Errors for auth/pairing flows.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("pairing code must be exactly 8 characters, got {0}")]
    InvalidPairingCodeLength(usize),
    #[error("device identity signature verification failed")]
    InvalidDeviceIdentity,
    #[error("qr channel is full")]
    QrChannelFull,
    #[error("qr channel is closed")]
    QrChannelClosed,
}

/// Unified crate-level error for callers that don't need per-component granularity.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    BinaryNode(#[from] BinaryNodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    GroupCipher(#[from] GroupCipherError),
    #[error(transparent)]
    PreKey(#[from] PreKeyError),
    #[error(transparent)]
    DeviceResolver(#[from] DeviceResolverError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}
