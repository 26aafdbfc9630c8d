//! Cache backend abstraction.
//!
//! The executor consumes this seam to restore previous output instead of
//! re-running a command. A backend stores the files matched by a script's
//! output globs plus the captured stdout/stderr, keyed by fingerprint
//! digest, and applies them back on a hit. The local directory backend
//! ships here; remote backends plug in behind the same trait.

pub mod local;

use std::future::Future;

use color_eyre::Result;

use crate::{fingerprint::CacheableFingerprint, glob::GlobEntry, script::ScriptConfig};

pub use local::LocalCache;

pub trait Cache: Clone + Send + Sync + 'static {
    type Hit: CacheHit;

    /// Look up a previously saved result for `script` at `fingerprint`.
    fn get(
        &self,
        script: &ScriptConfig,
        fingerprint: &CacheableFingerprint,
    ) -> impl Future<Output = Result<Option<Self::Hit>>> + Send;

    /// Save the script's output for `fingerprint`.
    ///
    /// `outputs` is the expanded output-glob result, already verified to
    /// live inside the package directory. The backend also captures the
    /// script's replay files so a future hit can re-emit stdout/stderr.
    fn set(
        &self,
        script: &ScriptConfig,
        fingerprint: &CacheableFingerprint,
        outputs: &[GlobEntry],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A successful lookup, holding everything needed to restore.
pub trait CacheHit: Send {
    /// Write the archived output back into the package directory and the
    /// replay files back into the script's state directory. The executor
    /// guarantees output cleaning already happened.
    fn apply(self) -> impl Future<Output = Result<()>> + Send;
}
