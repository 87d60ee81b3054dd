//! ChaCha20 — the inner chat layer.
//!
//! IETF variant, 12-byte random nonce prepended to the ciphertext, no
//! associated data. The stream cipher is deliberately unauthenticated:
//! a tampered or wrong-password frame decrypts to garbage, which the chat
//! layer logs and drops exactly like any other undecryptable message.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::{rngs::OsRng, RngCore};

use crate::errors::ProtocolError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut buf = plaintext.to_vec();
    let mut cipher = ChaCha20::new(key.into(), (&nonce).into());
    cipher.apply_keystream(&mut buf);

    let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&buf);
    out
}

pub fn decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() < NONCE_LEN {
        return Err(ProtocolError::BadCipher("chacha frame too short"));
    }
    let nonce: [u8; NONCE_LEN] = data[..NONCE_LEN].try_into().expect("length checked above");

    let mut buf = data[NONCE_LEN..].to_vec();
    let mut cipher = ChaCha20::new(key.into(), (&nonce).into());
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}
