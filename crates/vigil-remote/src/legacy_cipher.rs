// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envelope codec spoken by legacy `restore.php` extraction scripts.
//!
//! AES-128 in counter mode with a password-derived key:
//!
//! - key: the first 16 bytes of the password (zero padded), encrypted with
//!   themselves as the key
//! - counter block: an 8-byte nonce (2 bytes of milliseconds, 2 random bytes,
//!   4 bytes of unix seconds, all little-endian) followed by the big-endian
//!   64-bit block index
//! - wire form: base64 of nonce followed by ciphertext
//!
//! Responses come back wrapped in `###` markers.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::RemoteError;

const BLOCK: usize = 16;
const NONCE: usize = 8;
const MARKER: &str = "###";

type Aes128Ctr = ctr::Ctr64BE<Aes128>;

/// Counter-mode cipher keyed from a shared password.
#[derive(Clone)]
pub struct LegacyCipher {
    key: [u8; BLOCK],
}

impl LegacyCipher {
    /// Derive the cipher from the shared password.
    pub fn new(password: &str) -> Self {
        let mut seed = [0u8; BLOCK];
        for (slot, byte) in seed.iter_mut().zip(password.bytes()) {
            *slot = byte;
        }

        let mut key = GenericArray::clone_from_slice(&seed);
        Aes128::new(GenericArray::from_slice(&seed)).encrypt_block(&mut key);

        let mut derived = [0u8; BLOCK];
        derived.copy_from_slice(&key);
        Self { key: derived }
    }

    /// Encrypt with a fresh nonce.
    pub fn encrypt(&self, plaintext: &str) -> String {
        self.encrypt_with_nonce(plaintext, fresh_nonce())
    }

    /// Encrypt with a caller-supplied nonce.
    pub fn encrypt_with_nonce(&self, plaintext: &str, nonce: [u8; NONCE]) -> String {
        let mut out = Vec::with_capacity(NONCE + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend(self.apply_keystream(&nonce, plaintext.as_bytes()));
        STANDARD.encode(out)
    }

    /// Decrypt a base64 envelope.
    pub fn decrypt(&self, encoded: &str) -> Result<String, RemoteError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| RemoteError::Decryption(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE {
            return Err(RemoteError::Decryption("envelope shorter than its nonce".into()));
        }

        let (nonce, body) = raw.split_at(NONCE);
        let mut counter_nonce = [0u8; NONCE];
        counter_nonce.copy_from_slice(nonce);

        let plain = self.apply_keystream(&counter_nonce, body);
        String::from_utf8(plain)
            .map_err(|_| RemoteError::Decryption("plaintext is not UTF-8; wrong password?".into()))
    }

    fn apply_keystream(&self, nonce: &[u8; NONCE], data: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; BLOCK];
        iv[..NONCE].copy_from_slice(nonce);

        let mut out = data.to_vec();
        Aes128Ctr::new(GenericArray::from_slice(&self.key), GenericArray::from_slice(&iv))
            .apply_keystream(&mut out);
        out
    }
}

fn fresh_nonce() -> [u8; NONCE] {
    let now = chrono::Utc::now();
    let millis = (now.timestamp_subsec_millis() % 1000) as u16;
    let random: u16 = rand::random();
    let seconds = now.timestamp() as u32;

    let mut nonce = [0u8; NONCE];
    nonce[0..2].copy_from_slice(&millis.to_le_bytes());
    nonce[2..4].copy_from_slice(&random.to_le_bytes());
    nonce[4..8].copy_from_slice(&seconds.to_le_bytes());
    nonce
}

/// Extract the payload between the first pair of `###` markers. Servers often
/// prepend PHP notices, so anything outside the markers is ignored.
pub fn unwrap_marked(body: &str) -> Result<&str, RemoteError> {
    let start = body
        .find(MARKER)
        .ok_or_else(|| RemoteError::Malformed("response has no ### marker".into()))?
        + MARKER.len();
    let len = body[start..]
        .find(MARKER)
        .ok_or_else(|| RemoteError::Malformed("response has no closing ### marker".into()))?;
    Ok(&body[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE_FIXED: [u8; NONCE] = [0x39, 0x01, 0xaa, 0x55, 0x10, 0x20, 0x30, 0x40];

    #[test]
    fn test_round_trip_multi_block() {
        let cipher = LegacyCipher::new("s3cr3t-shared-password");
        let plaintext = r#"{"task":"stepRestore","factory":"Tzo5OiJBS0ZhY3RvcnkiOjE6e30="}"#;

        let encoded = cipher.encrypt(plaintext);
        assert_eq!(cipher.decrypt(&encoded).unwrap(), plaintext);
    }

    #[test]
    fn test_nonce_prefix_and_length() {
        let cipher = LegacyCipher::new("pw");
        let encoded = cipher.encrypt_with_nonce("hello world", NONCE_FIXED);
        let raw = STANDARD.decode(&encoded).unwrap();

        assert_eq!(&raw[..NONCE], &NONCE_FIXED);
        assert_eq!(raw.len(), NONCE + "hello world".len());
        assert_ne!(&raw[NONCE..], b"hello world");
    }

    #[test]
    fn test_deterministic_for_fixed_nonce() {
        let a = LegacyCipher::new("pw").encrypt_with_nonce("same", NONCE_FIXED);
        let b = LegacyCipher::new("pw").encrypt_with_nonce("same", NONCE_FIXED);
        let c = LegacyCipher::new("other").encrypt_with_nonce("same", NONCE_FIXED);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_only_first_sixteen_password_bytes_matter() {
        let long = LegacyCipher::new("0123456789abcdefTAIL");
        let short = LegacyCipher::new("0123456789abcdef");
        let encoded = long.encrypt_with_nonce("payload", NONCE_FIXED);
        assert_eq!(short.decrypt(&encoded).unwrap(), "payload");
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let cipher = LegacyCipher::new("pw");
        assert!(matches!(
            cipher.decrypt("not base64 !!"),
            Err(RemoteError::Decryption(_))
        ));
        assert!(matches!(
            cipher.decrypt(&STANDARD.encode([1u8, 2, 3])),
            Err(RemoteError::Decryption(_))
        ));
    }

    #[test]
    fn test_keystream_counts_blocks_big_endian_after_nonce() {
        let cipher = LegacyCipher::new("pw");
        let zeros = [0u8; 2 * BLOCK];
        let raw = STANDARD
            .decode(cipher.encrypt_with_nonce(std::str::from_utf8(&zeros).unwrap(), NONCE_FIXED))
            .unwrap();

        let aes = Aes128::new(GenericArray::from_slice(&cipher.key));
        for index in 0..2u64 {
            let mut block = [0u8; BLOCK];
            block[..NONCE].copy_from_slice(&NONCE_FIXED);
            block[NONCE..].copy_from_slice(&index.to_be_bytes());
            let mut expected = GenericArray::clone_from_slice(&block);
            aes.encrypt_block(&mut expected);

            let start = NONCE + index as usize * BLOCK;
            assert_eq!(&raw[start..start + BLOCK], expected.as_slice());
        }
    }

    #[test]
    fn test_unwrap_marked() {
        assert_eq!(
            unwrap_marked("Notice: blah\n###abc###trailing").unwrap(),
            "abc"
        );
        assert!(unwrap_marked("no markers").is_err());
        assert!(unwrap_marked("###open only").is_err());
    }
}
