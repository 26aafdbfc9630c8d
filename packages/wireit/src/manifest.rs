//! Manifest (`package.json`) loading and caching.
//!
//! One read per package directory per process: concurrent callers for the
//! same directory share a single in-flight read, and the parsed result
//! (including failure results) is memoized for the life of the process.
//! File-level problems are reported at most once per file regardless of
//! how many scripts in that package get analyzed.

pub mod ast;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{instrument, trace};

use crate::{
    diagnostic::{Failure, FailureKind, Location, Span},
    fs,
    manifest::ast::{Entry, ObjectNode},
    script::ScriptReference,
};

pub const MANIFEST_NAME: &str = "package.json";

/// The `scripts[name]` sentinel that hands a script over to wireit.
pub const WIREIT_COMMAND: &str = "wireit";

/// Historical alias for the sentinel, kept for compatibility.
pub const WIREIT_COMMAND_YARN_ALIAS: &str = "yarn run -TB wireit";

/// A file-level problem that prevented the manifest from being used.
#[derive(Clone, Debug)]
pub enum FileIssue {
    Missing,
    Invalid { message: String, span: Span },
}

/// A top-level section with the wrong shape (e.g. `scripts` not an
/// object). The manifest is otherwise usable.
#[derive(Clone, Debug)]
pub struct ShapeIssue {
    pub section: &'static str,
    pub span: Span,
}

/// The usable parts of a parsed manifest.
#[derive(Clone, Debug, Default)]
pub struct PackageContents {
    pub scripts: Option<ObjectNode>,
    pub wireit: Option<ObjectNode>,
    /// Names from `dependencies` followed by `devDependencies`, in
    /// declared order. Used by `<dependencies>#name` expansion.
    pub dependencies: Vec<String>,
}

/// A parsed (or failed-to-parse) manifest for one package directory.
#[derive(Debug)]
pub struct Package {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub contents: Option<PackageContents>,
    file_issue: Option<FileIssue>,
    shape_issues: Vec<ShapeIssue>,
    reported: AtomicBool,
}

/// Byte-offset-bearing pointers at one script's declarations.
#[derive(Copy, Clone, Debug)]
pub struct ScriptInfo<'p> {
    pub script: Option<&'p Entry>,
    pub wireit: Option<&'p Entry>,
}

impl Package {
    pub fn file_issue(&self) -> Option<&FileIssue> {
        self.file_issue.as_ref()
    }

    /// Pointers into the `scripts` and `wireit` sections for one name.
    pub fn script_info(&self, name: &str) -> ScriptInfo<'_> {
        let contents = self.contents.as_ref();
        ScriptInfo {
            script: contents
                .and_then(|contents| contents.scripts.as_ref())
                .and_then(|scripts| scripts.get(name)),
            wireit: contents
                .and_then(|contents| contents.wireit.as_ref())
                .and_then(|wireit| wireit.get(name)),
        }
    }

    /// The failures this file itself is responsible for, reported at most
    /// once per process. `trigger` is the script whose analysis caused
    /// the read; file-level failure identity is keyed by the file, so a
    /// richer dependency-edge failure can supersede these later.
    pub fn reportable_failures(&self, trigger: &ScriptReference) -> Vec<Failure> {
        if self.reported.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        let mut failures = Vec::new();
        match &self.file_issue {
            Some(FileIssue::Missing) => {
                failures.push(Failure::error(
                    FailureKind::MissingPackageJson,
                    trigger.clone(),
                    format!("no package.json was found in {}", self.dir.display()),
                ));
            }
            Some(FileIssue::Invalid { message, span }) => {
                failures.push(
                    Failure::error(
                        FailureKind::InvalidPackageJson,
                        trigger.clone(),
                        format!("invalid JSON syntax: {message}"),
                    )
                    .at(Location {
                        file: self.manifest.clone(),
                        span: *span,
                    }),
                );
            }
            None => {}
        }
        for issue in &self.shape_issues {
            failures.push(
                Failure::error(
                    FailureKind::InvalidConfigSyntax,
                    trigger.clone(),
                    format!("the \"{}\" section must be an object", issue.section),
                )
                .at(Location {
                    file: self.manifest.clone(),
                    span: issue.span,
                }),
            );
        }
        failures
    }
}

/// Loads and caches one manifest per absolute package directory.
#[derive(Debug, Default)]
pub struct PackageReader {
    packages: DashMap<PathBuf, Arc<OnceCell<Arc<Package>>>>,
}

impl PackageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the manifest for `dir`, once per process.
    #[instrument(name = "PackageReader::read", skip(self))]
    pub async fn read(&self, dir: &Path) -> Arc<Package> {
        let cell = {
            let entry = self.packages.entry(dir.to_path_buf()).or_default();
            Arc::clone(entry.value())
        };
        cell.get_or_init(|| async {
            trace!(?dir, "load manifest");
            Arc::new(load(dir).await)
        })
        .await
        .clone()
    }

    /// How many distinct package directories have been read. Used by
    /// tests asserting exactly-once reads.
    pub fn loaded_count(&self) -> usize {
        self.packages.len()
    }
}

async fn load(dir: &Path) -> Package {
    let manifest = dir.join(MANIFEST_NAME);
    let mut package = Package {
        dir: dir.to_path_buf(),
        manifest: manifest.clone(),
        contents: None,
        file_issue: None,
        shape_issues: Vec::new(),
        reported: AtomicBool::new(false),
    };

    let text = match fs::read_buffered_utf8(&manifest).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            package.file_issue = Some(FileIssue::Missing);
            return package;
        }
        Err(err) => {
            package.file_issue = Some(FileIssue::Invalid {
                message: format!("{err:#}"),
                span: Span::new(0, 0),
            });
            return package;
        }
    };

    let root = match ast::parse(&text) {
        Ok(root) => root,
        Err(message) => {
            package.file_issue = Some(FileIssue::Invalid {
                message,
                span: Span::new(0, 0),
            });
            return package;
        }
    };
    let Some(root) = root.as_object() else {
        package.file_issue = Some(FileIssue::Invalid {
            message: String::from("package.json is not an object"),
            span: root.span(),
        });
        return package;
    };

    let mut contents = PackageContents::default();
    for (section, slot) in [
        ("scripts", &mut contents.scripts),
        ("wireit", &mut contents.wireit),
    ] {
        if let Some(entry) = root.get(section) {
            match entry.value.as_object() {
                Some(object) => *slot = Some(object.clone()),
                None => package.shape_issues.push(ShapeIssue {
                    section,
                    span: entry.value.span(),
                }),
            }
        }
    }
    for section in ["dependencies", "devDependencies"] {
        if let Some(object) = root.get(section).and_then(|entry| entry.value.as_object()) {
            contents
                .dependencies
                .extend(object.entries.iter().map(|entry| entry.key.value.clone()));
        }
    }

    package.contents = Some(contents);
    package
}
