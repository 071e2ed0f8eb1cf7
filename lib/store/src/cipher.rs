//! Credential encryption at rest.
//!
//! Blob layout: `[version: 1 byte][nonce: 24 bytes][ciphertext + Poly1305 tag]`.
//! The account key is bound in as associated data, so a blob copied onto a
//! different account fails to open.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
#[allow(deprecated)] // upstream generic-array 0.x deprecation
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thinkone_core::AccountKey;
use zeroize::Zeroizing;

use crate::account::{Credential, CredentialKind, SealedCredential};
use crate::error::CipherError;

/// Version tag for XChaCha20-Poly1305 blobs.
const VERSION_TAG: u8 = 0x01;

/// Nonce size for XChaCha20-Poly1305.
const NONCE_LEN: usize = 24;

/// Poly1305 tag size.
const TAG_LEN: usize = 16;

/// Key size in bytes.
pub const KEY_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct CredentialPlaintext<'a> {
    kind: CredentialKind,
    /// Borrowed from the credential when sealing so no unzeroized copy of
    /// the secret is made.
    secret: Cow<'a, str>,
}

/// Seals and opens credential blobs with a single symmetric key.
pub struct CredentialCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl CredentialCipher {
    /// Creates a cipher from raw key bytes.
    #[must_use]
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Creates a cipher from base64-encoded key material.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).map_err(|e| {
            CipherError::InvalidKey {
                reason: format!("not valid base64: {e}"),
            }
        })?);
        let key: [u8; KEY_LEN] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CipherError::InvalidKey {
                    reason: format!("expected {KEY_LEN} bytes, got {}", decoded.len()),
                })?;
        Ok(Self::new(key))
    }

    /// Loads key material from a reference of the form `env:NAME` or
    /// `file:/path/to/key`.
    pub fn from_key_ref(key_ref: &str) -> Result<Self, CipherError> {
        let material = if let Some(var) = key_ref.strip_prefix("env:") {
            Zeroizing::new(std::env::var(var).map_err(|e| CipherError::KeySource {
                reason: format!("environment variable {var}: {e}"),
            })?)
        } else if let Some(path) = key_ref.strip_prefix("file:") {
            Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
                CipherError::KeySource {
                    reason: format!("key file {path}: {e}"),
                }
            })?)
        } else {
            return Err(CipherError::KeySource {
                reason: "key reference must start with 'env:' or 'file:'".to_string(),
            });
        };
        Self::from_base64(&material)
    }

    /// Encrypts a credential for the given account.
    #[allow(deprecated)]
    pub fn seal(
        &self,
        account: &AccountKey,
        credential: &Credential,
    ) -> Result<SealedCredential, CipherError> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&CredentialPlaintext {
                kind: credential.kind(),
                secret: Cow::Borrowed(credential.expose()),
            })
            .map_err(|e| CipherError::EncryptionFailed {
                reason: e.to_string(),
            })?,
        );

        let cipher = XChaCha20Poly1305::new(self.key.as_ref().into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload {
                msg: plaintext.as_slice(),
                aad: account.as_str().as_bytes(),
            })
            .map_err(|e| CipherError::EncryptionFailed {
                reason: e.to_string(),
            })?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(VERSION_TAG);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(SealedCredential::from_bytes(blob))
    }

    /// Decrypts a credential blob belonging to the given account.
    #[allow(deprecated)]
    pub fn open(
        &self,
        account: &AccountKey,
        sealed: &SealedCredential,
    ) -> Result<Credential, CipherError> {
        let blob = sealed.as_bytes();
        let Some((&version, rest)) = blob.split_first() else {
            return Err(CipherError::DecryptionFailed {
                reason: "empty blob".to_string(),
            });
        };
        if version != VERSION_TAG {
            return Err(CipherError::DecryptionFailed {
                reason: format!("unsupported blob version {version:#04x}"),
            });
        }
        if rest.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::DecryptionFailed {
                reason: "ciphertext too short".to_string(),
            });
        }

        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(self.key.as_ref().into());
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(XNonce::from_slice(nonce_bytes), Payload {
                    msg: ciphertext,
                    aad: account.as_str().as_bytes(),
                })
                .map_err(|e| CipherError::DecryptionFailed {
                    reason: e.to_string(),
                })?,
        );

        let decoded: CredentialPlaintext =
            serde_json::from_slice(&plaintext).map_err(|e| CipherError::DecryptionFailed {
                reason: format!("malformed credential payload: {e}"),
            })?;
        Ok(Credential::new(decoded.kind, decoded.secret.into_owned()))
    }
}
