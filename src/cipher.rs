//! Stream Cipher Transform
//!
//! A reversible keyed byte transform: every byte is XORed with the key byte
//! at the same absolute stream position modulo the key length.
//!
//! ```text
//! output[i] = data[i] ^ key[i % key.len()]
//! ```
//!
//! Applying the transform twice with the same key yields the original
//! bytes, so one routine serves both the upload and download paths.
//!
//! ## Limitations
//!
//! This is a confidentiality veneer, not encryption in the cryptographic
//! sense. There is no integrity protection: corrupted ciphertext decrypts
//! silently to corrupted plaintext. Use TLS for transport security.

use std::fmt;
use std::sync::Arc;

/// Transform `data` with `key`, returning a new buffer of the same length.
///
/// An empty key returns the input unchanged.
pub fn transform(data: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_at(key, 0, &mut out);
    out
}

/// In-place transform of a chunk that begins at absolute stream `offset`.
fn apply_at(key: &[u8], offset: u64, buf: &mut [u8]) {
    if key.is_empty() {
        return;
    }

    let len = key.len() as u64;
    let mut k = (offset % len) as usize;
    for byte in buf.iter_mut() {
        *byte ^= key[k];
        k += 1;
        if k == key.len() {
            k = 0;
        }
    }
}

/// Key material plus an on/off switch, fixed for the lifetime of a transfer.
///
/// Cloning is cheap; the key is shared.
#[derive(Clone, Default)]
pub struct CipherContext {
    key: Arc<[u8]>,
    enabled: bool,
}

impl CipherContext {
    /// An enabled context using `key`
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Arc::from(key.as_ref()),
            enabled: true,
        }
    }

    /// A context that passes bytes through untouched
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build a context from the settings pair `(enabled, key)`
    pub fn from_settings(enabled: bool, key: &str) -> Self {
        if enabled {
            Self::new(key.as_bytes())
        } else {
            Self::disabled()
        }
    }

    /// Whether bytes are actually transformed
    pub fn is_active(&self) -> bool {
        self.enabled && !self.key.is_empty()
    }

    /// Transform `buf` in place, treating `buf[0]` as stream byte `offset`.
    ///
    /// Feeding consecutive chunks with their running offsets produces exactly
    /// the bytes [`transform`] would produce for the whole stream.
    pub fn apply(&self, offset: u64, buf: &mut [u8]) {
        if self.enabled {
            apply_at(&self.key, offset, buf);
        }
    }
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("enabled", &self.enabled)
            .field("key_len", &self.key.len())
            .finish()
    }
}
