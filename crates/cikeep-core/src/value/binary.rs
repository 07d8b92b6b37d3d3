//! # Binary Proxy
//!
//! Content-addressed handle for one binary (image) payload.
//!
//! A proxy always knows the SHA-256 hash, the byte size and the MIME type
//! of its payload. The payload itself is optional: reads that only need
//! metadata produce proxies without data.

use crate::primitives::HASH_LENGTH;
use crate::types::CmdbError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Handle for one binary payload.
///
/// Equality and hashing consider hash, size and MIME type only; whether the
/// payload is loaded does not matter.
#[derive(Clone)]
pub struct BinaryProxy {
    hash: [u8; HASH_LENGTH],
    size: u32,
    mime_type: String,
    data: Option<Vec<u8>>,
}

impl BinaryProxy {
    /// Build a proxy holding `bytes`, computing the hash.
    pub fn from_bytes(mime_type: impl Into<String>, bytes: Vec<u8>) -> Result<Self, CmdbError> {
        let size = checked_size(bytes.len())?;
        Ok(Self {
            hash: sha256(&bytes),
            size,
            mime_type: mime_type.into(),
            data: Some(bytes),
        })
    }

    /// Build a metadata-only proxy from a previously known hash.
    pub fn from_hash(
        hash: &[u8],
        mime_type: impl Into<String>,
        size: u32,
    ) -> Result<Self, CmdbError> {
        Ok(Self {
            hash: hash_array(hash)?,
            size,
            mime_type: mime_type.into(),
            data: None,
        })
    }

    /// Build a proxy from a known hash plus its payload.
    ///
    /// Fails if `size` is not the payload length or the payload does not
    /// hash to `hash`.
    pub fn from_hash_and_data(
        hash: &[u8],
        mime_type: impl Into<String>,
        size: u32,
        bytes: Vec<u8>,
    ) -> Result<Self, CmdbError> {
        let hash = hash_array(hash)?;
        if bytes.len() != size as usize {
            return Err(CmdbError::InvalidBinaryProxy(format!(
                "declared size {} but payload has {} bytes",
                size,
                bytes.len()
            )));
        }
        if sha256(&bytes) != hash {
            return Err(CmdbError::InvalidBinaryProxy(
                "payload does not match its hash".to_string(),
            ));
        }
        Ok(Self {
            hash,
            size,
            mime_type: mime_type.into(),
            data: Some(bytes),
        })
    }

    pub fn has_full_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn hash(&self) -> &[u8; HASH_LENGTH] {
        &self.hash
    }

    /// Lowercase hex rendering of the hash.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// The same proxy with the payload dropped.
    pub fn without_data(&self) -> Self {
        Self {
            hash: self.hash,
            size: self.size,
            mime_type: self.mime_type.clone(),
            data: None,
        }
    }
}

fn sha256(bytes: &[u8]) -> [u8; HASH_LENGTH] {
    Sha256::digest(bytes).into()
}

fn hash_array(hash: &[u8]) -> Result<[u8; HASH_LENGTH], CmdbError> {
    hash.try_into().map_err(|_| {
        CmdbError::InvalidBinaryProxy(format!(
            "hash must be {} bytes, got {}",
            HASH_LENGTH,
            hash.len()
        ))
    })
}

// Sizes travel as signed 32-bit integers on the wire.
fn checked_size(len: usize) -> Result<u32, CmdbError> {
    if len > i32::MAX as usize {
        return Err(CmdbError::InvalidBinaryProxy(format!(
            "payload of {} bytes exceeds maximum size",
            len
        )));
    }
    Ok(len as u32)
}

impl PartialEq for BinaryProxy {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.size == other.size && self.mime_type == other.mime_type
    }
}

impl Eq for BinaryProxy {}

impl Hash for BinaryProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.size.hash(state);
        self.mime_type.hash(state);
    }
}

impl fmt::Debug for BinaryProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryProxy")
            .field("hash", &self.hash_hex())
            .field("size", &self.size)
            .field("mime_type", &self.mime_type)
            .field("has_full_data", &self.has_full_data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_computes_hash() {
        let proxy = BinaryProxy::from_bytes("image/png", b"abc".to_vec()).expect("proxy");
        assert_eq!(
            proxy.hash_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(proxy.size(), 3);
        assert!(proxy.has_full_data());
        assert_eq!(proxy.data(), Some(&b"abc"[..]));
    }

    #[test]
    fn from_hash_is_metadata_only() {
        let full = BinaryProxy::from_bytes("image/png", vec![1, 2, 3, 4]).expect("proxy");
        let meta = BinaryProxy::from_hash(full.hash(), "image/png", 4).expect("proxy");
        assert!(!meta.has_full_data());
        assert_eq!(full, meta);
    }

    #[test]
    fn from_hash_rejects_wrong_length() {
        let result = BinaryProxy::from_hash(&[0u8; 31], "image/png", 0);
        assert!(matches!(result, Err(CmdbError::InvalidBinaryProxy(_))));
    }

    #[test]
    fn from_hash_and_data_checks_size_and_hash() {
        let full = BinaryProxy::from_bytes("image/jpeg", vec![9; 10]).expect("proxy");

        let ok = BinaryProxy::from_hash_and_data(full.hash(), "image/jpeg", 10, vec![9; 10]);
        assert!(ok.is_ok());

        let wrong_size = BinaryProxy::from_hash_and_data(full.hash(), "image/jpeg", 11, vec![9; 10]);
        assert!(wrong_size.is_err());

        let wrong_data = BinaryProxy::from_hash_and_data(full.hash(), "image/jpeg", 10, vec![8; 10]);
        assert!(wrong_data.is_err());
    }

    #[test]
    fn equality_ignores_payload_but_not_mime() {
        let a = BinaryProxy::from_bytes("image/png", vec![1]).expect("proxy");
        let b = a.without_data();
        assert_eq!(a, b);

        let c = BinaryProxy::from_hash(a.hash(), "image/gif", 1).expect("proxy");
        assert_ne!(a, c);
    }
}
