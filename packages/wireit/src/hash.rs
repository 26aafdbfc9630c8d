//! Hashing operations and types.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256 as Sha256Hasher};
use tokio::io::AsyncReadExt;
use tracing::{instrument, trace};

/// A SHA-256 hash, hex encoded.
///
/// Input file contents and fingerprint payloads are both keyed by this
/// type; equality is byte-for-byte on the hex encoding.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Sha256(String);

impl Sha256 {
    /// Hash the contents of the file at the specified path.
    ///
    /// The file is streamed through the hasher in chunks so that large
    /// inputs don't get buffered wholesale.
    #[instrument(name = "Sha256::from_file")]
    pub async fn from_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open {path:?} for hashing"))?;

        let mut hasher = Sha256Hasher::new();
        let mut buffer = vec![0u8; 64 * 1024];
        let mut bytes = 0usize;
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .with_context(|| format!("read {path:?} for hashing"))?;
            if read == 0 {
                break;
            }
            bytes += read;
            hasher.update(&buffer[..read]);
        }

        let hash = hex::encode(hasher.finalize());
        trace!(?path, ?hash, ?bytes, "hash file");
        Ok(Self(hash))
    }

    /// Hash the contents of a buffer.
    #[instrument(skip_all, name = "Sha256::from_buffer")]
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let mut hasher = Sha256Hasher::new();
        hasher.update(buffer);

        let hash = hex::encode(hasher.finalize());
        trace!(?hash, bytes = ?buffer.len(), "hash buffer");
        Self(hash)
    }

    /// View the hash as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Sha256> for Sha256 {
    fn from(hash: &Sha256) -> Self {
        hash.clone()
    }
}

impl AsRef<str> for Sha256 {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}
