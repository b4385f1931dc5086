//! Cryptographic transport and session core for a WhatsApp Web
//! multi-device client: Noise handshake, Signal double-ratchet 1:1
//! sessions, sender-key group cipher, pre-key lifecycle, device/LID
//! resolution, fan-out relay, connection supervision, and auth/pairing.
//!
//! This crate is a library: all I/O (the socket, the key-value store, the
//! logging sink) is injected by the caller through the traits each module
//! exposes. There is no `run()` entry point and no bundled binary.

pub mod auth;
pub mod binary_node;
pub mod device;
pub mod error;
pub mod events;
pub mod group;
pub mod keys;
pub mod noise;
pub mod prekey;
pub mod proto;
pub mod relay;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use error::CoreError;
