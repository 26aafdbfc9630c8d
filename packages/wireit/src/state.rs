//! Per-script on-disk state.
//!
//! Every script owns `<packageDir>/.wireit/<hex(script name)>/` holding
//! the fingerprint of its last successful run plus captured stdout and
//! stderr for replay. The script name is hex encoded because script names
//! routinely contain characters filesystems reserve (`:`, `/`, …).

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tokio::io::AsyncWriteExt;
use tracing::{instrument, trace};

use crate::{
    fingerprint::CacheableFingerprint,
    fs,
    logger::{Logger, OutputStream},
    script::ScriptReference,
};

/// Name of the state directory inside each package.
pub const DATA_DIR: &str = ".wireit";

const FINGERPRINT_FILE: &str = "fingerprint";

/// Handle on one script's state directory.
#[derive(Clone, Debug)]
pub struct StateDir {
    reference: ScriptReference,
    root: PathBuf,
}

impl StateDir {
    pub fn new(reference: &ScriptReference) -> Self {
        let root = reference
            .package_dir
            .join(DATA_DIR)
            .join(hex::encode(reference.name.as_bytes()));
        Self {
            reference: reference.clone(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the local cache for this script, keyed by fingerprint
    /// digest below this directory.
    pub fn cache_root(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.root.join(FINGERPRINT_FILE)
    }

    pub fn capture_path(&self, stream: OutputStream) -> PathBuf {
        match stream {
            OutputStream::Stdout => self.root.join("stdout"),
            OutputStream::Stderr => self.root.join("stderr"),
        }
    }

    /// Read and parse the previous fingerprint. Unparseable bytes (e.g.
    /// from an incompatible version) read as absent.
    #[instrument(name = "StateDir::read_fingerprint", skip(self), fields(script = %self.reference))]
    pub async fn read_fingerprint(&self) -> Result<Option<CacheableFingerprint>> {
        let Some(bytes) = fs::read_buffered_utf8(self.fingerprint_path()).await? else {
            return Ok(None);
        };
        Ok(CacheableFingerprint::parse(&bytes))
    }

    /// Persist the fingerprint atomically: a crash mid-write must never
    /// leave a truncated fingerprint claiming outputs match.
    #[instrument(name = "StateDir::write_fingerprint", skip_all, fields(script = %self.reference))]
    pub async fn write_fingerprint(&self, fingerprint: &CacheableFingerprint) -> Result<()> {
        fs::write_atomic(self.fingerprint_path(), fingerprint.canonical())
            .await
            .context("write fingerprint")
    }

    /// Remove the stored fingerprint. Called before anything destructive
    /// happens so an interrupted run reads as stale, not fresh.
    pub async fn clear_fingerprint(&self) -> Result<()> {
        fs::remove_path(self.fingerprint_path())
            .await
            .context("clear fingerprint")
    }

    /// Drop previous capture files ahead of a new run.
    pub async fn reset_captures(&self) -> Result<()> {
        fs::remove_path(self.capture_path(OutputStream::Stdout)).await?;
        fs::remove_path(self.capture_path(OutputStream::Stderr)).await?;
        Ok(())
    }

    pub fn capture(&self, stream: OutputStream) -> CaptureSink {
        CaptureSink {
            path: self.capture_path(stream),
            file: None,
        }
    }

    /// Stream a previous run's captured output to the logger, preserving
    /// per-stream order.
    #[instrument(name = "StateDir::replay", skip(self, logger), fields(script = %self.reference))]
    pub async fn replay(&self, stream: OutputStream, logger: &dyn Logger) -> Result<()> {
        let path = self.capture_path(stream);
        let Some(content) = fs::read_buffered(&path).await? else {
            return Ok(());
        };
        trace!(?path, bytes = content.len(), "replay capture");
        logger.output(&self.reference, stream, &content);
        Ok(())
    }
}

/// Append-only capture sink, created lazily on the first byte so that a
/// silent script leaves no capture file behind.
#[derive(Debug)]
pub struct CaptureSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl CaptureSink {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("open capture {:?}", self.path))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .expect("sink file was just opened")
            .write_all(chunk)
            .await
            .with_context(|| format!("append capture {:?}", self.path))
    }
}
