//! X25519 peer key agreement with password mixing — the inner layer.
//!
//! `chacha_key = SHA-256( X25519(my_priv, peer_pub) XOR SHA-256(password) )`
//!
//! Mixing the password hash into the shared secret means two clients with
//! different passwords derive different keys for the same peer pair: a wrong
//! password is observable only as persistent decryption failures, and the
//! relay learns nothing either way.

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::errors::ProtocolError;

pub const PEER_KEY_LEN: usize = 32;

/// One static keypair per client connection; the secret is DH'd against
/// every peer in the channel.
pub fn generate_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

pub fn derive_peer_key(
    secret: &StaticSecret,
    peer_pub: &[u8],
    password: &str,
) -> Result<[u8; PEER_KEY_LEN], ProtocolError> {
    let peer_bytes: [u8; 32] = peer_pub
        .try_into()
        .map_err(|_| ProtocolError::MalformedFrame("peer public key must be 32 bytes".into()))?;
    let shared = secret.diffie_hellman(&PublicKey::from(peer_bytes));

    let password_hash = Sha256::digest(password.as_bytes());
    let mut mixed = [0u8; 32];
    for (i, byte) in mixed.iter_mut().enumerate() {
        *byte = shared.as_bytes()[i] ^ password_hash[i];
    }
    let key = Sha256::digest(mixed);
    mixed.zeroize();
    Ok(key.into())
}
