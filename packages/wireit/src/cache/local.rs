//! Local directory cache backend.
//!
//! Archives live inside each script's state directory at
//! `<packageDir>/.wireit/<hexname>/cache/<fingerprint digest>/`:
//!
//! ```text
//! <digest>/
//!   manifest.json      record of archived entries
//!   files/<relative>   archived regular files
//!   replay/stdout      captured stdout, if the script produced any
//!   replay/stderr      captured stderr, if the script produced any
//! ```
//!
//! Saves are staged in a sibling temp directory and renamed into place so
//! a concurrent reader never observes a half-written archive.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{
    cache::{Cache, CacheHit},
    fingerprint::CacheableFingerprint,
    fs,
    glob::{EntryKind, GlobEntry},
    logger::OutputStream,
    script::ScriptConfig,
    state::StateDir,
};

const MANIFEST_NAME: &str = "manifest.json";

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalCache;

impl LocalCache {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ArchiveManifest {
    entries: Vec<ArchiveEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ArchiveEntry {
    /// Forward-slashed path relative to the package directory.
    relative: String,
    kind: ArchiveEntryKind,
    /// Link target, for symlink entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link: Option<String>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
enum ArchiveEntryKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "directory")]
    Directory,
    #[serde(rename = "symlink")]
    Symlink,
}

fn archive_dir(script: &ScriptConfig, fingerprint: &CacheableFingerprint) -> PathBuf {
    StateDir::new(&script.reference)
        .cache_root()
        .join(fingerprint.digest().as_str())
}

impl Cache for LocalCache {
    type Hit = LocalCacheHit;

    #[instrument(name = "LocalCache::get", skip_all, fields(script = %script.reference))]
    async fn get(
        &self,
        script: &ScriptConfig,
        fingerprint: &CacheableFingerprint,
    ) -> Result<Option<LocalCacheHit>> {
        let archive = archive_dir(script, fingerprint);
        let Some(manifest) = fs::read_buffered_utf8(archive.join(MANIFEST_NAME)).await? else {
            return Ok(None);
        };
        let manifest: ArchiveManifest =
            serde_json::from_str(&manifest).context("decode archive manifest")?;
        trace!(?archive, entries = manifest.entries.len(), "cache hit");
        Ok(Some(LocalCacheHit {
            archive,
            manifest,
            package_dir: script.reference.package_dir.clone(),
            state: StateDir::new(&script.reference),
        }))
    }

    #[instrument(name = "LocalCache::set", skip_all, fields(script = %script.reference))]
    async fn set(
        &self,
        script: &ScriptConfig,
        fingerprint: &CacheableFingerprint,
        outputs: &[GlobEntry],
    ) -> Result<()> {
        let archive = archive_dir(script, fingerprint);
        if fs::symlink_metadata(&archive).await?.is_some() {
            trace!(?archive, "already cached");
            return Ok(());
        }

        let staging = archive.with_file_name(format!(".tmp-{}", fingerprint.digest().as_str()));
        fs::remove_path(&staging).await?;
        fs::create_dir_all(&staging).await?;

        let mut entries = Vec::with_capacity(outputs.len());
        for output in outputs {
            let entry = match output.kind {
                EntryKind::File => {
                    fs::copy_file(&output.absolute, staging.join("files").join(&output.relative))
                        .await
                        .context("archive output file")?;
                    ArchiveEntry {
                        relative: output.relative.clone(),
                        kind: ArchiveEntryKind::File,
                        link: None,
                    }
                }
                EntryKind::Directory => ArchiveEntry {
                    relative: output.relative.clone(),
                    kind: ArchiveEntryKind::Directory,
                    link: None,
                },
                EntryKind::Symlink => ArchiveEntry {
                    relative: output.relative.clone(),
                    kind: ArchiveEntryKind::Symlink,
                    link: Some(fs::read_link(&output.absolute).await?),
                },
            };
            entries.push(entry);
        }

        let state = StateDir::new(&script.reference);
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let capture = state.capture_path(stream);
            if fs::symlink_metadata(&capture).await?.is_some() {
                fs::copy_file(&capture, staging.join("replay").join(stream.to_string()))
                    .await
                    .context("archive replay capture")?;
            }
        }

        let manifest = serde_json::to_string(&ArchiveManifest { entries })
            .context("encode archive manifest")?;
        fs::write(staging.join(MANIFEST_NAME), manifest).await?;

        match tokio::fs::rename(&staging, &archive).await {
            Ok(()) => Ok(()),
            // A concurrent save of the same fingerprint won the rename.
            Err(_) if fs::symlink_metadata(&archive).await?.is_some() => {
                fs::remove_path(&staging).await
            }
            Err(err) => Err(err).with_context(|| format!("publish archive {archive:?}")),
        }
    }
}

pub struct LocalCacheHit {
    archive: PathBuf,
    manifest: ArchiveManifest,
    package_dir: PathBuf,
    state: StateDir,
}

impl CacheHit for LocalCacheHit {
    #[instrument(name = "LocalCacheHit::apply", skip_all)]
    async fn apply(self) -> Result<()> {
        for entry in &self.manifest.entries {
            let target = self.package_dir.join(Path::new(&entry.relative));
            match entry.kind {
                ArchiveEntryKind::File => {
                    fs::copy_file(self.archive.join("files").join(&entry.relative), target)
                        .await
                        .context("restore output file")?;
                }
                ArchiveEntryKind::Directory => {
                    fs::create_dir_all(&target).await?;
                }
                ArchiveEntryKind::Symlink => {
                    if let Some(link) = &entry.link {
                        fs::make_symlink(link, &target).await?;
                    }
                }
            }
        }

        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let archived = self.archive.join("replay").join(stream.to_string());
            if fs::symlink_metadata(&archived).await?.is_some() {
                fs::copy_file(&archived, self.state.capture_path(stream)).await?;
            }
        }
        Ok(())
    }
}
