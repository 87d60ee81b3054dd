//! AES-256-CBC — the outer transport layer.
//!
//! Wire form: `IV(16) ‖ ciphertext`, PKCS#7 padding, fresh random IV per
//! frame. Authentication comes from the layer above: a frame that unpads
//! under the wrong key still has to parse as a JSON envelope.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};

use crate::errors::ProtocolError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
const BLOCK: usize = 16;

pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(key.into(), (&iv).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

pub fn decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() < IV_LEN + BLOCK || (data.len() - IV_LEN) % BLOCK != 0 {
        return Err(ProtocolError::BadCipher("aes ciphertext length"));
    }
    let iv: [u8; IV_LEN] = data[..IV_LEN].try_into().expect("length checked above");
    let ciphertext = &data[IV_LEN..];

    Aes256CbcDec::new(key.into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ProtocolError::BadCipher("aes unpad"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [3u8; 32];
        let ct = encrypt(&key, b"hello channel");
        assert_eq!(decrypt(&key, &ct).unwrap(), b"hello channel");
    }

    #[test]
    fn fresh_iv_per_frame() {
        let key = [3u8; 32];
        let a = encrypt(&key, b"same plaintext");
        let b = encrypt(&key, b"same plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_never_round_trips() {
        let ct = encrypt(&[3u8; 32], b"hello channel");
        // Wrong-key unpad may accidentally succeed; it must never yield the
        // original plaintext.
        match decrypt(&[4u8; 32], &ct) {
            Ok(pt) => assert_ne!(pt, b"hello channel"),
            Err(_) => {}
        }
    }

    #[test]
    fn truncated_input_rejected() {
        let key = [3u8; 32];
        assert!(decrypt(&key, &[0u8; 8]).is_err());
        assert!(decrypt(&key, &[0u8; IV_LEN + 15]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn round_trips_arbitrary_bytes(key in proptest::array::uniform32(0u8..), pt in proptest::collection::vec(0u8.., 0..2048)) {
            let ct = encrypt(&key, &pt);
            proptest::prop_assert_eq!(decrypt(&key, &ct).unwrap(), pt);
        }
    }
}
