//! Failure taxonomy shared by analysis and execution.
//!
//! Failures are *data*, not error chains: analysis collects every problem
//! it can find in one pass, deduplicates superseded entries, and renders
//! the full set at the end. Infrastructure errors (I/O that should never
//! fail) stay on the `color_eyre` path instead.

use std::{fmt, path::PathBuf};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::script::ScriptReference;

/// A byte-offset range into a manifest file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// A file plus the byte range within it that a diagnostic points at.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Location {
    pub file: PathBuf,
    pub span: Span,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}..{}",
            self.file.display(),
            self.span.start,
            self.span.end
        )
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum Severity {
    #[display("error")]
    Error,
    #[display("warning")]
    Warning,
}

/// Everything that can go wrong, by kind.
///
/// Kinds are stable identifiers: they participate in supersedes matching
/// and test assertions, so renaming one is a breaking change.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum FailureKind {
    #[display("missing-package-json")]
    MissingPackageJson,
    #[display("invalid-package-json")]
    InvalidPackageJson,
    #[display("invalid-config-syntax")]
    InvalidConfigSyntax,
    #[display("script-not-found")]
    ScriptNotFound,
    #[display("script-not-wireit")]
    ScriptNotWireit,
    #[display("dependency-on-missing-script")]
    DependencyOnMissingScript,
    #[display("dependency-on-missing-package-json")]
    DependencyOnMissingPackageJson,
    #[display("duplicate-dependency")]
    DuplicateDependency,
    #[display("cycle")]
    Cycle,
    #[display("dependency-invalid")]
    DependencyInvalid,
    #[display("spawn-error")]
    SpawnError,
    #[display("exit-non-zero")]
    ExitNonZero,
    #[display("signaled")]
    Signaled,
    #[display("output-outside-package")]
    OutputOutsidePackage,
    #[display("dependency-failed")]
    DependencyFailed,
}

/// A secondary location attached to a failure, e.g. one edge of a cycle
/// or the second occurrence of a duplicate dependency.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Annotation {
    pub message: String,
    pub location: Option<Location>,
}

/// A single diagnostic: which script, what kind, where, and optionally
/// which other failure this one supersedes.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Failure {
    pub kind: FailureKind,
    pub severity: Severity,
    pub script: ScriptReference,
    pub message: String,
    pub location: Option<Location>,
    pub supplemental: Vec<Annotation>,
    /// Identity of a less specific failure that this one replaces.
    pub supersedes: Option<String>,
}

impl Failure {
    pub fn error(kind: FailureKind, script: ScriptReference, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            script,
            message: message.into(),
            location: None,
            supplemental: Vec::new(),
            supersedes: None,
        }
    }

    pub fn warning(kind: FailureKind, script: ScriptReference, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(kind, script, message)
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn superseding(mut self, identity: String) -> Self {
        self.supersedes = Some(identity);
        self
    }

    pub fn with_supplemental(mut self, annotation: Annotation) -> Self {
        self.supplemental.push(annotation);
        self
    }

    /// The identity used for supersedes matching.
    ///
    /// File-level failures are identified by the file they describe, not
    /// by the script that happened to trigger the read, so that a richer
    /// dependency-edge failure from *any* script can supersede them.
    pub fn identity(&self) -> String {
        match self.kind {
            FailureKind::MissingPackageJson | FailureKind::InvalidPackageJson => {
                format!("{}:{}", self.kind, self.script.package_dir.display())
            }
            _ => format!("{}:{}", self.kind, self.script.key()),
        }
    }

    /// Identity a failure of `kind` about `script` would have.
    pub fn identity_of(kind: FailureKind, script: &ScriptReference) -> String {
        match kind {
            FailureKind::MissingPackageJson | FailureKind::InvalidPackageJson => {
                format!("{}:{}", kind, script.package_dir.display())
            }
            _ => format!("{}:{}", kind, script.key()),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.severity, self.script, self.message)?;
        if let Some(location) = &self.location {
            write!(f, "\n    --> {location}")?;
        }
        for note in &self.supplemental {
            write!(f, "\n    note: {}", note.message)?;
            if let Some(location) = &note.location {
                write!(f, " ({location})")?;
            }
        }
        Ok(())
    }
}

/// Drop superseded failures, dedupe, and order the rest deterministically.
pub fn finalize(mut failures: Vec<Failure>) -> Vec<Failure> {
    let superseded: std::collections::HashSet<String> = failures
        .iter()
        .filter_map(|failure| failure.supersedes.clone())
        .collect();
    failures.retain(|failure| !superseded.contains(&failure.identity()));
    failures.sort_by(|a, b| {
        (a.script.key(), &a.location, a.kind).cmp(&(b.script.key(), &b.location, b.kind))
    });
    failures.dedup_by(|a, b| a.kind == b.kind && a.script == b.script && a.location == b.location);
    failures
}
