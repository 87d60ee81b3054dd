//! RSA-2048 OAEP (SHA-256) — relay identity and key-exchange wrapping.
//!
//! The relay holds a long-lived keypair (rotated by the keystore); each
//! client generates a throwaway keypair per connection so the relay can wrap
//! its ECDH reply. Public keys travel as SPKI DER; a 2048-bit OAEP block
//! carries at most 190 bytes, enough for a SEC1 P-384 point.

use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::errors::ProtocolError;

pub const RSA_BITS: usize = 2048;

pub fn generate_keypair() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|e| anyhow!("rsa keygen failed: {e}"))
}

pub fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    Ok(key
        .to_public_key_der()
        .map_err(|e| anyhow!("rsa public key encode failed: {e}"))?
        .as_bytes()
        .to_vec())
}

pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, ProtocolError> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|_| ProtocolError::MalformedFrame("bad RSA public key DER".into()))
}

pub fn private_key_der(key: &RsaPrivateKey) -> Result<Vec<u8>> {
    Ok(key
        .to_pkcs8_der()
        .map_err(|e| anyhow!("rsa private key encode failed: {e}"))?
        .as_bytes()
        .to_vec())
}

pub fn private_key_from_der(der: &[u8]) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(der).map_err(|e| anyhow!("rsa private key decode failed: {e}"))
}

pub fn oaep_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|_| ProtocolError::BadCipher("rsa-oaep encrypt"))
}

pub fn oaep_decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    key.decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|_| ProtocolError::BadCipher("rsa-oaep decrypt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oaep_round_trip() {
        let sk = generate_keypair().unwrap();
        let pk = RsaPublicKey::from(&sk);
        let wrapped = oaep_encrypt(&pk, b"a 97-byte SEC1 point goes here").unwrap();
        let opened = oaep_decrypt(&sk, &wrapped).unwrap();
        assert_eq!(opened, b"a 97-byte SEC1 point goes here");
    }

    #[test]
    fn wrong_key_fails() {
        let sk_a = generate_keypair().unwrap();
        let sk_b = generate_keypair().unwrap();
        let wrapped = oaep_encrypt(&RsaPublicKey::from(&sk_a), b"secret").unwrap();
        assert!(oaep_decrypt(&sk_b, &wrapped).is_err());
    }

    #[test]
    fn der_round_trip() {
        let sk = generate_keypair().unwrap();
        let pk = RsaPublicKey::from(&sk);

        let pub_der = public_key_der(&pk).unwrap();
        assert_eq!(public_key_from_der(&pub_der).unwrap(), pk);

        // The restored private key must unwrap what the original public
        // key wrapped.
        let priv_der = private_key_der(&sk).unwrap();
        let restored = private_key_from_der(&priv_der).unwrap();
        let wrapped = oaep_encrypt(&pk, b"slot survives a restart").unwrap();
        assert_eq!(oaep_decrypt(&restored, &wrapped).unwrap(), b"slot survives a restart");
    }

    #[test]
    fn garbage_der_rejected() {
        assert!(public_key_from_der(b"not a key").is_err());
    }
}
