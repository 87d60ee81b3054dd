//! Cryptographic primitives for the two protocol layers.
//!
//! Outer layer (client ↔ relay): RSA-2048 OAEP authenticates the relay and
//! wraps the ECDH-P384 exchange; the derived 32-byte key drives AES-256-CBC
//! on every subsequent frame.
//!
//! Inner layer (client ↔ client): X25519 mixed with the SHA-256 of the room
//! password derives a per-peer ChaCha20 key the relay never sees.

pub mod aes;
pub mod chacha;
pub mod curve;
pub mod ecdh;
pub mod rsa;
