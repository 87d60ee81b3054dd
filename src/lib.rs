//! NodeCrypt — a zero-knowledge end-to-end encrypted chat relay.
//!
//! Two protection layers, three key establishments:
//!
//! 1. The relay holds a rotating RSA-2048 identity advertised to every new
//!    client.
//! 2. Each client↔relay session runs ECDH-P384 (wrapped in RSA-OAEP) and
//!    derives an AES-256-CBC key that protects every subsequent frame on
//!    that transport.
//! 3. Each client↔client pair runs X25519 mixed with the SHA-256 of the
//!    room password and derives a ChaCha20 key the relay never learns.
//!
//! The relay ([`relay`]) decrypts only the outer layer — enough to route —
//! and re-encrypts per recipient. The chat client ([`client`]) drives both
//! layers and surfaces a typed event stream.

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod relay;

pub use client::{events::ClientEvent, ChatClient, ClientOptions};
pub use config::RelayConfig;
pub use relay::RelayContext;
