//! Client-side per-peer cryptographic state.
//!
//! ```text
//! seen in list ──send(my x25519 pub)──▶ AwaitingPeerPub
//! AwaitingPeerPub ──recv(peer pub)────▶ Established
//! ```
//!
//! `Established ⟺ chacha_key present`. Nothing is ever encrypted to a peer
//! that is not established; ciphertext arriving *from* a peer before its key
//! exchange completes is buffered (bounded) and drained on establishment.

use x25519_dalek::StaticSecret;

use crate::codec::ClientId;
use crate::crypto::{chacha, curve};
use crate::errors::ProtocolError;

/// Ciphertexts that raced ahead of the key exchange. Anything beyond this
/// is dropped — the peer will be established within one round trip.
const PENDING_CAP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Seen in a list; our public key not yet sent.
    Announced,
    /// Our public key sent; waiting for the peer's.
    AwaitingPeerPub,
    /// Shared ChaCha20 key derived.
    Established,
}

pub struct PeerSession {
    pub id: ClientId,
    pub user_name: String,
    state: PeerState,
    chacha_key: Option<[u8; 32]>,
    pending: Vec<Vec<u8>>,
}

impl PeerSession {
    pub fn new(id: ClientId, user_name: String) -> Self {
        Self {
            id,
            user_name,
            state: PeerState::Announced,
            chacha_key: None,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == PeerState::Established
    }

    pub fn mark_key_sent(&mut self) {
        if self.state == PeerState::Announced {
            self.state = PeerState::AwaitingPeerPub;
        }
    }

    /// Derive the shared key from the peer's public key and drain any
    /// ciphertexts that arrived early. Re-deriving on a repeated key is
    /// harmless — the result is identical.
    pub fn establish(
        &mut self,
        my_secret: &StaticSecret,
        peer_pub: &[u8],
        password: &str,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.chacha_key = Some(curve::derive_peer_key(my_secret, peer_pub, password)?);
        self.state = PeerState::Established;
        Ok(std::mem::take(&mut self.pending))
    }

    /// Encrypt a chat plaintext for this peer. `None` until established.
    pub fn encrypt(&self, plaintext: &[u8]) -> Option<Vec<u8>> {
        self.chacha_key.as_ref().map(|key| chacha::encrypt(key, plaintext))
    }

    /// Decrypt a chat ciphertext from this peer. `None` until established.
    /// A wrong-password peer yields garbage here, not an error — the chat
    /// layer notices when the payload fails to parse.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Option<Result<Vec<u8>, ProtocolError>> {
        self.chacha_key.as_ref().map(|key| chacha::decrypt(key, ciphertext))
    }

    /// Buffer a ciphertext that arrived before establishment.
    pub fn buffer(&mut self, ciphertext: Vec<u8>) {
        if self.pending.len() < PENDING_CAP {
            self.pending.push(ciphertext);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
