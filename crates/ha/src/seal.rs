//! Key material sealing
//!
//! Derived IKE keys are needed by the standby node for takeover but must
//! never reach the shared store, or the logs, in cleartext. The active node
//! seals them with AES-256-GCM under a key shared by the HA pair; the SA id
//! is bound as additional authenticated data so a sealed blob cannot be
//! replayed under another SA's record.
//!
//! # Bundle Format
//!
//! ```text
//! repeat { u32 length (big endian) || bytes }
//! ```
//!
//! For IKE keys the parts are: shared secret, initiator nonce, responder
//! nonce.

use crate::event::{KeyMaterialRef, SaIdentifier, KEY_PREFIX};
use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Seal key length in bytes
pub const SEAL_KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Seals and opens key material for one HA pair
pub struct KeySealer {
    key: Zeroizing<[u8; SEAL_KEY_LEN]>,
}

impl KeySealer {
    /// Create a sealer from raw key bytes
    pub fn new(key: [u8; SEAL_KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Create a sealer from a 64 character hex string
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(hex_key.trim()).map_err(|_| Error::Seal("seal key is not hex".into()))?,
        );
        if bytes.len() != SEAL_KEY_LEN {
            return Err(Error::Seal(format!(
                "seal key must be {} bytes, got {}",
                SEAL_KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; SEAL_KEY_LEN];
        key.copy_from_slice(&bytes);
        let sealer = Self::new(key);
        zeroize::Zeroize::zeroize(&mut key);
        Ok(sealer)
    }

    /// Seal `material` for `sa`
    pub fn seal(&self, sa: SaIdentifier, material: &[u8]) -> Result<KeyMaterialRef> {
        let cipher = Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|_| Error::Seal("failed to create AES-GCM cipher".into()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let aad = associated_data(sa);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: material,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Seal("AES-GCM encryption failed".into()))?;

        Ok(KeyMaterialRef::Sealed {
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Open a sealed reference produced for `sa`
    pub fn open(&self, sa: SaIdentifier, sealed: &KeyMaterialRef) -> Result<Zeroizing<Vec<u8>>> {
        let (nonce, ciphertext) = match sealed {
            KeyMaterialRef::Sealed { nonce, ciphertext } => (nonce, ciphertext),
            other => {
                return Err(Error::Seal(format!(
                    "cannot open non-sealed reference {:?}",
                    other
                )))
            }
        };

        let nonce = hex::decode(nonce).map_err(|_| Error::Seal("nonce is not hex".into()))?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::Seal(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let ciphertext =
            hex::decode(ciphertext).map_err(|_| Error::Seal("ciphertext is not hex".into()))?;

        let cipher = Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|_| Error::Seal("failed to create AES-GCM cipher".into()))?;
        let aad = associated_data(sa);

        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| Error::Seal("AES-GCM authentication failed".into()))
    }
}

impl std::fmt::Debug for KeySealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySealer(<redacted>)")
    }
}

fn associated_data(sa: SaIdentifier) -> Vec<u8> {
    format!("{}:{}", KEY_PREFIX, sa).into_bytes()
}

/// Concatenate length-prefixed parts into a zeroizing buffer
pub fn pack(parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
    let total = parts.iter().map(|p| 4 + p.len()).sum();
    let mut out = Zeroizing::new(Vec::with_capacity(total));
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Split a buffer produced by [`pack`]
pub fn unpack(mut data: &[u8]) -> Result<Vec<Zeroizing<Vec<u8>>>> {
    let mut parts = Vec::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(Error::Seal("truncated length prefix".into()));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        data = &data[4..];
        if data.len() < len {
            return Err(Error::Seal(format!(
                "part needs {} bytes, have {}",
                len,
                data.len()
            )));
        }
        parts.push(Zeroizing::new(data[..len].to_vec()));
        data = &data[len..];
    }
    Ok(parts)
}
