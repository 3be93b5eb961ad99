use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::credit::PaygError;
use crate::credit::codes::KEY_MINIMUM_LENGTH_BYTES;

/// The secret shared between code generation and verification.
///
/// The key bytes are never printed; `Debug` shows the length and a short
/// SHA-256 fingerprint so two deployments can be compared in logs.
///
/// # Example
///
/// ```rust
/// use payg::SharedKey;
///
/// let key = SharedKey::new(vec![7u8; 64]).unwrap();
/// assert_eq!(key.len(), 64);
/// assert!(!format!("{key:?}").contains("7, 7"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey {
    bytes: Vec<u8>,
}

impl SharedKey {
    /// Wraps raw key material, rejecting keys shorter than 64 bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, PaygError> {
        let bytes = bytes.into();
        if bytes.len() < KEY_MINIMUM_LENGTH_BYTES {
            return Err(PaygError::InvalidKey);
        }
        Ok(Self { bytes })
    }

    /// Reads a key file.
    ///
    /// Returns `Ok(None)` if the file does not exist, which deployments use
    /// to signal that credit enforcement is off.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Option<Self>, PaygError> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let key = Self::new(bytes)?;
                debug!(path = %path.display(), fingerprint = %key.fingerprint(), "Loaded key");
                Ok(Some(key))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PaygError::StorageError(format!(
                "failed to read key file {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// First four bytes of the SHA-256 of the key, hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.bytes);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey")
            .field("len", &self.bytes.len())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
