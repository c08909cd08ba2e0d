//! Payload encryption.
//!
//! Every device shares a 16-byte pre-shared token with the controller.
//! The AES key and IV are both derived from it: `K = MD5(token)`,
//! `IV = MD5(K || token)`, and payloads travel as AES-128-CBC with PKCS#7
//! padding under that pair.

use std::fmt;

use aes::Aes128;
use block_modes::block_padding::Pkcs7;
use block_modes::{BlockMode, Cbc};

use crate::bytes::md5_chain;
use crate::error::Error;

type Aes128Cbc = Cbc<Aes128, Pkcs7>;

/// The 16-byte pre-shared device secret.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token([u8; 16]);

impl Token {
    /// Decode the externalized form: a 32-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let raw = hex::decode(s.trim()).map_err(|err| Error::InvalidToken(err.to_string()))?;
        let bytes: [u8; 16] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidToken(format!("expected 16 bytes, got {}", raw.len())))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for Token {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", hex::encode(self.0))
    }
}

fn derive_key_iv(token: &Token) -> ([u8; 16], [u8; 16]) {
    let key = md5_chain(&[token.as_bytes()]);
    let iv = md5_chain(&[&key, token.as_bytes()]);
    (key, iv)
}

fn cipher(token: &Token) -> Aes128Cbc {
    let (key, iv) = derive_key_iv(token);
    // MD5 digests are always valid AES-128 key/IV material.
    Aes128Cbc::new_from_slices(&key, &iv).expect("16-byte key and iv")
}

/// Encrypt a plaintext payload. Empty input stays empty; no padding block
/// is emitted (header-only frames carry no ciphertext at all).
pub fn encrypt(token: &Token, plaintext: &[u8]) -> Vec<u8> {
    if plaintext.is_empty() {
        return Vec::new();
    }
    cipher(token).encrypt_vec(plaintext)
}

/// Decrypt a ciphertext payload. Empty input stays empty.
pub fn decrypt(token: &Token, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    if ciphertext.is_empty() {
        return Ok(Vec::new());
    }
    cipher(token)
        .decrypt_vec(ciphertext)
        .map_err(|_| Error::DecryptFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: [u8; 16] = [
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    #[test]
    fn token_from_hex() {
        let token = Token::from_hex("11223344556677889900aabbccddeeff").unwrap();
        assert_eq!(token.as_bytes(), &TOKEN);
        // Trailing whitespace happens when tokens are read from files.
        assert!(Token::from_hex("11223344556677889900aabbccddeeff\n").is_ok());
        assert!(Token::from_hex("0011").is_err());
        assert!(Token::from_hex("zz223344556677889900aabbccddeeff").is_err());
    }

    #[test]
    fn roundtrip() {
        let token = Token::from(TOKEN);
        let plaintext = br#"{"id":1,"method":"power","params":["off"]}"#;
        let ciphertext = encrypt(&token, plaintext);
        assert_ne!(&ciphertext[..], &plaintext[..]);
        // CBC/PKCS#7 always pads up to the next 16-byte boundary.
        assert_eq!(ciphertext.len() % 16, 0);
        assert!(ciphertext.len() > plaintext.len());
        assert_eq!(decrypt(&token, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn empty_payload_is_passed_through() {
        let token = Token::from(TOKEN);
        assert!(encrypt(&token, b"").is_empty());
        assert!(decrypt(&token, b"").unwrap().is_empty());
    }

    #[test]
    fn damaged_ciphertext_fails() {
        let token = Token::from(TOKEN);
        let mut ciphertext = encrypt(&token, b"{\"id\":1}");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(matches!(
            decrypt(&token, &ciphertext),
            Err(Error::DecryptFailure)
        ));
    }
}
