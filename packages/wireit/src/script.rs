//! The script data model: references, dependencies, and validated
//! configuration nodes produced by the analyzer.

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::diagnostic::Span;

/// The identity of a script: the absolute package directory that declares
/// it plus its name in the `scripts` section.
///
/// Two references are equal iff both fields are equal byte-for-byte.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ScriptReference {
    pub package_dir: PathBuf,
    pub name: String,
}

impl ScriptReference {
    pub fn new(package_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            package_dir: package_dir.into(),
            name: name.into(),
        }
    }

    /// The canonical string encoding, used as a map key everywhere a
    /// script identifies other scripts (placeholder table, fingerprint
    /// dependency entries, executor memoization).
    pub fn key(&self) -> ScriptKey {
        let encoded = serde_json::to_string(&(
            self.package_dir.to_string_lossy().as_ref(),
            self.name.as_str(),
        ))
        .expect("JSON encoding of two strings cannot fail");
        ScriptKey(encoded)
    }
}

impl fmt::Display for ScriptReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package_dir.display(), self.name)
    }
}

/// Canonical `JSON-encode([packageDir, name])` key for a script.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct ScriptKey(String);

impl ScriptKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An edge in the validated graph.
///
/// `cascade` controls fingerprint flow only: a non-cascading dependency
/// must still complete before the dependent runs, but its fingerprint does
/// not contribute to the dependent's fingerprint.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub config: Arc<ScriptConfig>,
    pub cascade: bool,
}

/// Policy for deleting previous output before a script runs.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
pub enum CleanPolicy {
    /// Delete output-glob matches before every run.
    #[display("true")]
    #[serde(rename = "true")]
    Always,
    /// Never delete output automatically.
    #[display("false")]
    #[serde(rename = "false")]
    Never,
    /// Delete output only when a previously fingerprinted input file has
    /// since disappeared.
    #[display("if-file-deleted")]
    #[serde(rename = "if-file-deleted")]
    IfFileDeleted,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        Self::Always
    }
}

/// One entry in a script's `env` section.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum EnvValue {
    /// A literal value, set on the child process and folded into the
    /// fingerprint verbatim.
    Literal(String),
    /// A variable inherited from the invoking environment. Only its
    /// resolved value participates in the fingerprint; the child sees
    /// whatever the parent environment provides.
    External { default: Option<String> },
}

/// Service configuration. Lifecycle management belongs to an external
/// supervisor; the analyzer only validates the shape.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ServiceConfig {
    /// Regex source matched against service output lines to detect
    /// readiness.
    pub ready_when_line_matches: Option<String>,
}

/// Byte ranges of interesting config sections, kept for diagnostics that
/// surface at execution time (e.g. an output glob escaping the package).
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ScriptAnnotations {
    pub command: Option<Span>,
    pub files: Option<Span>,
    pub output: Option<Span>,
    pub service: Option<Span>,
}

/// A fully validated script node.
///
/// Produced by the analyzer; immutable afterwards. Dependencies are
/// canonically sorted by `(packageDir, name)` so that identical graphs
/// fingerprint identically regardless of declaration order.
#[derive(Clone, Debug)]
pub struct ScriptConfig {
    pub reference: ScriptReference,
    /// Path to the manifest that declared this script.
    pub manifest: PathBuf,
    pub command: Option<String>,
    /// Trailing arguments, only ever populated on the root script.
    pub extra_args: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub files: Option<Vec<String>>,
    pub output: Option<Vec<String>>,
    pub clean: CleanPolicy,
    pub service: Option<ServiceConfig>,
    pub env: BTreeMap<String, EnvValue>,
    pub package_locks: Vec<String>,
    pub allow_usually_excluded_paths: bool,
    pub annotations: ScriptAnnotations,
}

impl ScriptConfig {
    pub fn key(&self) -> ScriptKey {
        self.reference.key()
    }

    /// Whether this script can participate in freshness checks and
    /// caching at all. A script with a command but no declared files has
    /// undeclared inputs and can never be skipped.
    pub fn declares_inputs(&self) -> bool {
        self.command.is_none() || self.files.is_some()
    }
}
