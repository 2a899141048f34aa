//! Payload ciphers.
//!
//! The engine treats the cipher as an opaque per-peer collaborator: one
//! `encrypt` on the way into a segment body, one `decrypt` on the way out.
//! [`DummyCrypt`] carries plaintext for tests and unencrypted flows;
//! [`AeadCrypt`] is ChaCha20-Poly1305 with a random nonce carried in front
//! of the ciphertext.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Key size for [`AeadCrypt`].
pub const KEY_SIZE: usize = 32;

/// Cipher errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptError {
    #[error("encrypt failed")]
    Encrypt,
    #[error("decrypt failed")]
    Decrypt,
    #[error("ciphertext too short")]
    ShortCiphertext,
}

/// Symmetric cipher applied to every segment body. Handles are opaque and
/// per-peer.
pub trait Crypt: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError>;
}

/// No-op cipher: the segment body is the plaintext.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyCrypt;

impl Crypt for DummyCrypt {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError> {
        Ok(ciphertext.to_vec())
    }
}

/// ChaCha20-Poly1305. Wire layout: 12-byte nonce, ciphertext, 16-byte tag.
pub struct AeadCrypt {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AeadCrypt {
    pub fn new(key: [u8; KEY_SIZE]) -> Result<Self, CryptError> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key).map_err(|_| CryptError::Encrypt)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl Crypt for AeadCrypt {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CryptError::Encrypt)?;

        let mut body = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| CryptError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError> {
        if ciphertext.len() < NONCE_LEN + CHACHA20_POLY1305.tag_len() {
            return Err(CryptError::ShortCiphertext);
        }
        let nonce: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
            .try_into()
            .map_err(|_| CryptError::ShortCiphertext)?;

        let mut body = ciphertext[NONCE_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| CryptError::Decrypt)?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_round_trip() {
        let crypt = DummyCrypt;
        let ct = crypt.encrypt(b"hello").unwrap();
        assert_eq!(ct, b"hello");
        assert_eq!(crypt.decrypt(&ct).unwrap(), b"hello");
    }

    #[test]
    fn test_aead_round_trip() {
        let crypt = AeadCrypt::new([7u8; KEY_SIZE]).unwrap();
        let ct = crypt.encrypt(b"hello").unwrap();
        assert_eq!(ct.len(), NONCE_LEN + 5 + CHACHA20_POLY1305.tag_len());
        assert_eq!(crypt.decrypt(&ct).unwrap(), b"hello");
    }

    #[test]
    fn test_aead_empty_payload() {
        let crypt = AeadCrypt::new([7u8; KEY_SIZE]).unwrap();
        let ct = crypt.encrypt(b"").unwrap();
        assert_eq!(crypt.decrypt(&ct).unwrap(), b"");
    }

    #[test]
    fn test_aead_nonces_differ() {
        let crypt = AeadCrypt::new([7u8; KEY_SIZE]).unwrap();
        let a = crypt.encrypt(b"hello").unwrap();
        let b = crypt.encrypt(b"hello").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aead_tamper_fails() {
        let crypt = AeadCrypt::new([7u8; KEY_SIZE]).unwrap();
        let mut ct = crypt.encrypt(b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert_eq!(crypt.decrypt(&ct), Err(CryptError::Decrypt));
    }

    #[test]
    fn test_aead_short_ciphertext() {
        let crypt = AeadCrypt::new([7u8; KEY_SIZE]).unwrap();
        assert_eq!(crypt.decrypt(&[0u8; 8]), Err(CryptError::ShortCiphertext));
    }

    #[test]
    fn test_aead_wrong_key_fails() {
        let a = AeadCrypt::new([1u8; KEY_SIZE]).unwrap();
        let b = AeadCrypt::new([2u8; KEY_SIZE]).unwrap();
        let ct = a.encrypt(b"hello").unwrap();
        assert_eq!(b.decrypt(&ct), Err(CryptError::Decrypt));
    }
}
