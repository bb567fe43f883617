// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-rest encryption for node credentials.
//!
//! Agent tokens are two-part (`tokenId.secret`). The identifier is stored
//! in the clear for lookup; the secret only ever touches the database
//! inside an encrypted envelope produced here. The envelope is
//! self-describing: `base64(iv || ciphertext || mac)` with AES-256-CBC
//! encryption and an HMAC-SHA256 tag over the IV and ciphertext, so a
//! tampered or wrongly-keyed envelope fails decryption instead of
//! yielding a plausible-looking secret.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// CBC initialization vector length in bytes.
const IV_LEN: usize = 16;

/// HMAC-SHA256 tag length in bytes.
const MAC_LEN: usize = 32;

/// Minimum plausible envelope: one IV, one cipher block, one tag.
const MIN_ENVELOPE_LEN: usize = IV_LEN + 16 + MAC_LEN;

/// Errors raised by vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The stored envelope is not a well-formed `base64(iv || ct || mac)` blob
    #[error("malformed credential envelope: {0}")]
    MalformedEnvelope(String),

    /// Authentication or decryption failed; wrong vault key or tampered data
    #[error("credential decryption failed (wrong vault key or tampered envelope)")]
    DecryptionFailed,
}

/// Encrypts and decrypts agent token secrets.
///
/// The key is derived from the configured passphrase: its UTF-8 bytes,
/// truncated or zero-padded to 32 bytes. Changing the passphrase
/// invalidates every stored envelope.
#[derive(Clone)]
pub struct TokenVault {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output.
        f.debug_struct("TokenVault").finish_non_exhaustive()
    }
}

impl TokenVault {
    /// Create a vault keyed from the given passphrase.
    pub fn new(passphrase: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        let bytes = passphrase.as_bytes();
        let take = bytes.len().min(KEY_LEN);
        key[..take].copy_from_slice(&bytes[..take]);
        Self { key }
    }

    /// Encrypt a secret into a storable envelope.
    ///
    /// A fresh random IV is drawn per call, so encrypting the same secret
    /// twice yields different envelopes.
    pub fn encrypt(&self, secret: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(secret.as_bytes());

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        blob.extend_from_slice(&self.mac(&blob));
        BASE64.encode(blob)
    }

    /// Decrypt a stored envelope back into the plaintext secret.
    pub fn decrypt(&self, envelope: &str) -> Result<String, VaultError> {
        let raw = BASE64
            .decode(envelope)
            .map_err(|e| VaultError::MalformedEnvelope(format!("invalid base64: {e}")))?;
        if raw.len() < MIN_ENVELOPE_LEN {
            return Err(VaultError::MalformedEnvelope(format!(
                "envelope is {} bytes, expected at least {MIN_ENVELOPE_LEN}",
                raw.len()
            )));
        }

        let (body, tag) = raw.split_at(raw.len() - MAC_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| VaultError::DecryptionFailed)?;

        let (iv, ciphertext) = body.split_at(IV_LEN);
        if ciphertext.len() % 16 != 0 {
            return Err(VaultError::MalformedEnvelope(
                "ciphertext is not block-aligned".to_string(),
            ));
        }

        let mut plaintext = Aes256CbcDec::new(&self.key.into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;

        match String::from_utf8(plaintext.clone()) {
            Ok(secret) => {
                plaintext.zeroize();
                Ok(secret)
            }
            Err(_) => {
                plaintext.zeroize();
                Err(VaultError::DecryptionFailed)
            }
        }
    }

    /// Assemble the `tokenId.secret` bearer credential from a token
    /// identifier and its encrypted envelope.
    pub fn format_bearer(&self, token_id: &str, envelope: &str) -> Result<String, VaultError> {
        let mut secret = self.decrypt(envelope)?;
        let bearer = format!("{token_id}.{secret}");
        secret.zeroize();
        Ok(bearer)
    }

    fn mac(&self, body: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(body);
        mac.finalize().into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let vault = TokenVault::new("a quite reasonable passphrase");
        let envelope = vault.encrypt("wLp4NUDBv0RHpKDzqZ3A");
        assert_ne!(envelope, "wLp4NUDBv0RHpKDzqZ3A");
        assert_eq!(vault.decrypt(&envelope).unwrap(), "wLp4NUDBv0RHpKDzqZ3A");
    }

    #[test]
    fn same_secret_encrypts_to_different_envelopes() {
        let vault = TokenVault::new("passphrase");
        let a = vault.encrypt("secret");
        let b = vault.encrypt("secret");
        assert_ne!(a, b);
        assert_eq!(vault.decrypt(&a).unwrap(), vault.decrypt(&b).unwrap());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let vault = TokenVault::new("first passphrase");
        let other = TokenVault::new("second passphrase");
        let envelope = vault.encrypt("secret");
        assert!(matches!(
            other.decrypt(&envelope),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let vault = TokenVault::new("passphrase");
        let envelope = vault.encrypt("an agent token secret value");

        let mut raw = BASE64.decode(&envelope).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            vault.decrypt(&tampered),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_iv_fails_closed() {
        let vault = TokenVault::new("passphrase");
        let envelope = vault.encrypt("an agent token secret value");

        let mut raw = BASE64.decode(&envelope).unwrap();
        raw[0] ^= 0xff;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            vault.decrypt(&tampered),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn garbage_is_malformed_not_a_panic() {
        let vault = TokenVault::new("passphrase");
        assert!(matches!(
            vault.decrypt("not base64 at all!!"),
            Err(VaultError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            vault.decrypt("AAAA"),
            Err(VaultError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn long_and_short_passphrases_are_usable() {
        let short = TokenVault::new("x");
        let long = TokenVault::new(&"y".repeat(100));
        assert_eq!(short.decrypt(&short.encrypt("s")).unwrap(), "s");
        assert_eq!(long.decrypt(&long.encrypt("s")).unwrap(), "s");
    }

    #[test]
    fn bearer_credential_joins_id_and_secret() {
        let vault = TokenVault::new("passphrase");
        let envelope = vault.encrypt("topsecret");
        let bearer = vault.format_bearer("abcdef0123456789", &envelope).unwrap();
        assert_eq!(bearer, "abcdef0123456789.topsecret");
    }
}
