//! Ephemeral ECDH over P-384 — the outer session key agreement.
//!
//! Public points travel as uncompressed SEC1 bytes (97 bytes), sized to ride
//! inside one RSA-2048 OAEP block. The session key is the first 32 bytes of
//! the raw shared-secret X coordinate (a 48-byte field element, left-padded
//! by definition).

use p384::ecdh::EphemeralSecret;
use p384::{EncodedPoint, PublicKey};
use rand::rngs::OsRng;

use crate::errors::ProtocolError;

pub const SESSION_KEY_LEN: usize = 32;

pub fn generate_keypair() -> (EphemeralSecret, Vec<u8>) {
    let secret = EphemeralSecret::random(&mut OsRng);
    let public = PublicKey::from(&secret);
    let point = EncodedPoint::from(public).as_bytes().to_vec();
    (secret, point)
}

pub fn derive_session_key(
    secret: &EphemeralSecret,
    peer_point_sec1: &[u8],
) -> Result<[u8; SESSION_KEY_LEN], ProtocolError> {
    let peer = PublicKey::from_sec1_bytes(peer_point_sec1)
        .map_err(|_| ProtocolError::MalformedFrame("invalid P-384 public point".into()))?;
    let shared = secret.diffie_hellman(&peer);

    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&shared.raw_secret_bytes()[..SESSION_KEY_LEN]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_same_key() {
        let (a_secret, a_point) = generate_keypair();
        let (b_secret, b_point) = generate_keypair();

        let a_key = derive_session_key(&a_secret, &b_point).unwrap();
        let b_key = derive_session_key(&b_secret, &a_point).unwrap();
        assert_eq!(a_key, b_key);
    }

    #[test]
    fn session_keys_are_pairwise_distinct() {
        // 100 concurrent sessions must never collide.
        let (server_secret, server_point) = generate_keypair();
        let mut keys = Vec::with_capacity(100);
        for _ in 0..100 {
            let (client_secret, _) = generate_keypair();
            keys.push(derive_session_key(&client_secret, &server_point).unwrap());
        }
        let _ = server_secret;
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "sessions {i} and {j} collided");
            }
        }
    }

    #[test]
    fn bad_point_rejected() {
        let (secret, _) = generate_keypair();
        assert!(derive_session_key(&secret, b"not a sec1 point").is_err());
    }

    #[test]
    fn point_is_uncompressed_sec1() {
        let (_, point) = generate_keypair();
        assert_eq!(point.len(), 97);
        assert_eq!(point[0], 0x04);
    }
}
