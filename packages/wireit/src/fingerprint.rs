//! Fingerprint computation.
//!
//! A fingerprint summarizes everything that can affect a script's output:
//! its command, clean policy, extra arguments, output patterns, the
//! content hashes of its input files, its environment projection, and the
//! fingerprints of its cascading dependencies. Byte equality of
//! fingerprints means the script does not need to re-run.
//!
//! Canonicalization discipline: every collection in the payload is a
//! `BTreeMap` (or kept in analyzer-sorted order), so serialization is
//! stable across processes regardless of discovery order. Dependency
//! entries record the dependency's digest rather than its whole payload,
//! which keeps deep graphs from blowing up the serialized form.

use std::{collections::BTreeMap, sync::Arc};

use color_eyre::{Result, eyre::Context};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{
    glob::{self, EntryKind},
    hash::Sha256,
    script::{CleanPolicy, EnvValue, ScriptConfig, ScriptKey},
};

/// How many input files get hashed concurrently.
const HASH_CONCURRENCY: usize = 10;

/// The stamp recorded for one matched input path.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum FileStamp {
    /// Regular file: SHA-256 of its bytes.
    #[serde(rename = "sha256")]
    File(String),
    /// Symlink: the link target string, never the resolved content.
    #[serde(rename = "link")]
    Symlink(String),
    /// Directory: presence only. The globs are responsible for
    /// enumerating descendants.
    #[serde(rename = "dir")]
    Directory,
}

/// The stamp recorded for one projected environment variable.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum EnvStamp {
    #[serde(rename = "value")]
    Value(String),
    #[serde(rename = "absent")]
    Absent,
}

/// The deterministic serialization a fingerprint digests.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FingerprintPayload {
    pub command: Option<String>,
    pub extra_args: Vec<String>,
    pub clean: CleanPolicy,
    /// Output patterns verbatim, in declared order.
    pub output: Option<Vec<String>>,
    /// Input stamps keyed by package-relative path.
    pub files: BTreeMap<String, FileStamp>,
    /// Projected environment, keyed by variable name.
    pub env: BTreeMap<String, EnvStamp>,
    /// Digests of cascading dependencies, keyed by canonical script key.
    pub dependencies: BTreeMap<String, String>,
}

/// A computed fingerprint for one script.
///
/// `Uncacheable` is a distinguished value, not a fingerprint: it never
/// compares fresh, is never written to disk, and poisons every cascading
/// dependent.
#[derive(Clone, Debug)]
pub enum Fingerprint {
    Uncacheable,
    Cacheable(Arc<CacheableFingerprint>),
}

impl Fingerprint {
    pub fn cacheable(&self) -> Option<&Arc<CacheableFingerprint>> {
        match self {
            Fingerprint::Cacheable(fingerprint) => Some(fingerprint),
            Fingerprint::Uncacheable => None,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CacheableFingerprint {
    payload: FingerprintPayload,
    /// The canonical bytes stored on disk and compared byte-for-byte.
    canonical: String,
    /// SHA-256 of the canonical bytes; used as the cache key and in
    /// dependent fingerprints.
    digest: Sha256,
}

impl CacheableFingerprint {
    fn from_payload(payload: FingerprintPayload) -> Result<Self> {
        let canonical =
            serde_json::to_string(&payload).context("serialize fingerprint payload")?;
        let digest = Sha256::from_buffer(canonical.as_bytes());
        Ok(Self {
            payload,
            canonical,
            digest,
        })
    }

    /// Parse previously stored canonical bytes. Returns `None` when the
    /// bytes don't parse (e.g. written by an incompatible version);
    /// callers treat that as "not fresh".
    pub fn parse(canonical: &str) -> Option<Self> {
        let payload: FingerprintPayload = serde_json::from_str(canonical).ok()?;
        Some(Self {
            payload,
            canonical: canonical.to_string(),
            digest: Sha256::from_buffer(canonical.as_bytes()),
        })
    }

    pub fn payload(&self) -> &FingerprintPayload {
        &self.payload
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn digest(&self) -> &Sha256 {
        &self.digest
    }

    /// Whether any input file recorded by `self` is no longer present in
    /// `current`. Drives the `"if-file-deleted"` clean policy.
    pub fn any_input_deleted(&self, current: &CacheableFingerprint) -> bool {
        self.payload
            .files
            .keys()
            .any(|path| !current.payload.files.contains_key(path))
    }
}

/// Compute the fingerprint for `script`.
///
/// `dep_fingerprints` carries one entry per *cascading* dependency. The
/// function is pure given its inputs and filesystem content.
#[instrument(name = "fingerprint", skip_all, fields(script = %script.reference))]
pub async fn fingerprint(
    script: &ScriptConfig,
    dep_fingerprints: &[(ScriptKey, Fingerprint)],
) -> Result<Fingerprint> {
    let mut dependencies = BTreeMap::new();
    for (key, fingerprint) in dep_fingerprints {
        match fingerprint {
            Fingerprint::Uncacheable => {
                trace!(dep = %key, "cascading dependency is uncacheable");
                return Ok(Fingerprint::Uncacheable);
            }
            Fingerprint::Cacheable(fingerprint) => {
                dependencies.insert(key.as_str().to_string(), fingerprint.digest.to_string());
            }
        }
    }

    // A command with undeclared inputs can never be safely skipped.
    if !script.declares_inputs() {
        return Ok(Fingerprint::Uncacheable);
    }
    let files = match &script.files {
        Some(patterns) => stamp_files(script, patterns).await?,
        None => BTreeMap::new(),
    };

    let payload = FingerprintPayload {
        command: script.command.clone(),
        extra_args: script.extra_args.clone(),
        clean: script.clean,
        output: script.output.clone(),
        files,
        env: project_env(script),
        dependencies,
    };
    let fingerprint = CacheableFingerprint::from_payload(payload)?;
    Ok(Fingerprint::Cacheable(Arc::new(fingerprint)))
}

async fn stamp_files(
    script: &ScriptConfig,
    patterns: &[String],
) -> Result<BTreeMap<String, FileStamp>> {
    let entries = glob::resolve(
        &script.reference.package_dir,
        patterns,
        script.allow_usually_excluded_paths,
    )
    .await
    .context("expand input files")?;

    futures::stream::iter(entries)
        .map(|entry| async move {
            let stamp = match entry.kind {
                EntryKind::File => FileStamp::File(
                    Sha256::from_file(&entry.absolute)
                        .await
                        .with_context(|| format!("hash input {:?}", entry.absolute))?
                        .to_string(),
                ),
                EntryKind::Symlink => {
                    FileStamp::Symlink(crate::fs::read_link(&entry.absolute).await?)
                }
                EntryKind::Directory => FileStamp::Directory,
            };
            Ok::<_, color_eyre::Report>((entry.relative, stamp))
        })
        .buffer_unordered(HASH_CONCURRENCY)
        .try_collect()
        .await
}

fn project_env(script: &ScriptConfig) -> BTreeMap<String, EnvStamp> {
    script
        .env
        .iter()
        .map(|(name, value)| {
            let stamp = match value {
                EnvValue::Literal(literal) => EnvStamp::Value(literal.clone()),
                EnvValue::External { default } => match std::env::var(name).ok().or_else(|| default.clone()) {
                    Some(value) => EnvStamp::Value(value),
                    None => EnvStamp::Absent,
                },
            };
            (name.clone(), stamp)
        })
        .collect()
}
