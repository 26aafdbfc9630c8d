//! Filesystem operations tailored to `wireit`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.
//!
//! Most helpers here map `NotFound` to `None` rather than an error: the
//! executor routinely probes for state files, previous outputs, and
//! manifests that legitimately may not exist yet.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use tokio::task::spawn_blocking;
use tracing::trace;

/// Read the file into a buffer, mapping `NotFound` to `None`.
pub async fn read_buffered(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {path:?}")),
    }
}

/// Read the file into a string, mapping `NotFound` to `None`.
pub async fn read_buffered_utf8(path: impl AsRef<Path>) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {path:?}")),
    }
}

/// Write the buffer to the file, creating parent directories as needed.
pub async fn write(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content.as_ref())
        .await
        .with_context(|| format!("write {path:?}"))
}

/// Write the buffer to the file atomically: the content lands in a
/// temporary file in the same directory and is renamed over the target.
///
/// Readers concurrently observing `path` see either the previous content
/// or the new content, never a partial write.
pub async fn write_atomic(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    let content = content.as_ref().to_vec();
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    create_dir_all(&parent).await?;

    spawn_blocking(move || -> Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&parent)
            .with_context(|| format!("create temp file in {parent:?}"))?;
        std::io::Write::write_all(&mut file, &content)
            .with_context(|| format!("write temp file in {parent:?}"))?;
        file.persist(&path)
            .with_context(|| format!("rename temp file over {path:?}"))?;
        trace!(?path, bytes = content.len(), "atomic write");
        Ok(())
    })
    .await
    .context("join task")?
}

/// Create the directory and all of its parents.
pub async fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("create directory {path:?}"))
}

/// Remove the path, whether it is a file, symlink, or directory tree.
/// Tolerates the path not existing.
pub async fn remove_path(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("stat {path:?}")),
    };

    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {path:?}")),
    }
}

/// Stat the path without following symlinks, mapping `NotFound` to `None`.
pub async fn symlink_metadata(path: impl AsRef<Path>) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("stat {path:?}")),
    }
}

/// Read the target of a symlink as a string.
pub async fn read_link(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let target = tokio::fs::read_link(path)
        .await
        .with_context(|| format!("read link {path:?}"))?;
    Ok(target.to_string_lossy().into_owned())
}

/// Copy a single file, creating the destination's parent directories.
pub async fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await?;
    }
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("copy {src:?} to {dst:?}"))
        .map(drop)
}

/// Recreate a symlink at `dst` pointing at `target`.
pub async fn make_symlink(target: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (target, dst) = (target.as_ref().to_path_buf(), dst.as_ref().to_path_buf());
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await?;
    }
    remove_path(&dst).await?;
    #[cfg(unix)]
    {
        tokio::fs::symlink(&target, &dst)
            .await
            .with_context(|| format!("symlink {dst:?} -> {target:?}"))
    }
    #[cfg(windows)]
    {
        tokio::fs::symlink_file(&target, &dst)
            .await
            .with_context(|| format!("symlink {dst:?} -> {target:?}"))
    }
}

/// Report whether `path` is lexically inside `base`.
///
/// Purely lexical: `..` components in `path` are resolved against the
/// joined form without touching the filesystem, so a path that climbs out
/// of `base` and back in still counts as inside only if the normalized
/// form stays under `base`.
pub fn is_within(base: impl AsRef<Path>, path: impl AsRef<Path>) -> bool {
    let base = normalize_lexically(base.as_ref());
    let path = normalize_lexically(path.as_ref());
    path.starts_with(&base) && path != base
}

/// Resolve `.` and `..` components without consulting the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
