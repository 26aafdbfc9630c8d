//! Filesystem glob expansion for `files` and `output` sections.
//!
//! Patterns are applied in order: a match on a plain pattern includes an
//! entry, a match on a `!`-negated pattern removes it, and a later plain
//! pattern can re-include it. Output is sorted and deduplicated, and
//! symlinks are never followed while matching.
//!
//! Patterns use forward slashes on every platform. A leading `/` anchors
//! to the package directory, which is where patterns are anchored anyway.
//! Leading `../` segments are supported so that amended package-lock
//! patterns can reach ancestor directories.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use derive_more::{Display, Error};
use globset::{GlobBuilder, GlobMatcher};
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};
use walkdir::WalkDir;

/// Directory names excluded from matching unless the script sets
/// `allowUsuallyExcludedPaths`.
const USUALLY_EXCLUDED: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".wireit",
    ".yarn",
    "CVS",
    "node_modules",
];

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum EntryKind {
    #[display("file")]
    File,
    #[display("directory")]
    Directory,
    #[display("symlink")]
    Symlink,
}

/// One filesystem entry matched by a pattern list.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct GlobEntry {
    /// Path relative to the package directory, forward-slashed. May begin
    /// with `../` for patterns that reach ancestor directories.
    pub relative: String,
    pub absolute: PathBuf,
    pub kind: EntryKind,
}

/// A glob pattern the user wrote that does not compile.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display("invalid glob pattern {pattern:?}: {message}")]
pub struct InvalidPatternError {
    pub pattern: String,
    pub message: String,
}

struct Step {
    negated: bool,
    /// Number of leading `../` segments peeled off the pattern.
    ascent: usize,
    rest: String,
    matcher: GlobMatcher,
}

/// Expand `patterns` against `base`.
///
/// The returned entries are sorted by relative path and deduplicated by
/// absolute path.
#[instrument(skip(patterns))]
pub async fn resolve(
    base: &Path,
    patterns: &[String],
    allow_usually_excluded: bool,
) -> Result<Vec<GlobEntry>> {
    let base = base.to_path_buf();
    let patterns = patterns.to_vec();
    spawn_blocking(move || resolve_blocking(&base, &patterns, allow_usually_excluded))
        .await
        .context("join task")?
}

fn resolve_blocking(
    base: &Path,
    patterns: &[String],
    allow_usually_excluded: bool,
) -> Result<Vec<GlobEntry>> {
    let steps = parse_patterns(patterns)?;

    // Steps are grouped by how far above the package directory they are
    // anchored; ordering within a group is preserved so negation and
    // re-inclusion still apply in declaration order.
    let mut groups: BTreeMap<usize, Vec<&Step>> = BTreeMap::new();
    for step in &steps {
        groups.entry(step.ascent).or_default().push(step);
    }

    let mut matches: BTreeMap<String, GlobEntry> = BTreeMap::new();
    for (ascent, group) in groups {
        let Some(group_base) = ancestor_at(base, ascent) else {
            // Ran out of ancestors; these patterns cannot match anything.
            trace!(?ascent, "pattern ascends past filesystem root");
            continue;
        };
        let prefix = "../".repeat(ascent);

        if group.iter().any(|step| !step.negated && has_wildcards(&step.rest)) {
            walk_group(&group_base, &prefix, &group, allow_usually_excluded, &mut matches)?;
        } else {
            probe_group(&group_base, &prefix, &group, &mut matches)?;
        }
    }

    let mut seen = std::collections::HashSet::new();
    let entries = matches
        .into_values()
        .filter(|entry| seen.insert(entry.absolute.clone()))
        .collect();
    Ok(entries)
}

fn ancestor_at(base: &Path, ascent: usize) -> Option<PathBuf> {
    let mut dir = base;
    for _ in 0..ascent {
        dir = dir.parent()?;
    }
    Some(dir.to_path_buf())
}

fn parse_patterns(patterns: &[String]) -> Result<Vec<Step>> {
    let mut steps = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let mut rest = pattern.as_str();
        let negated = match rest.strip_prefix('!') {
            Some(stripped) => {
                rest = stripped;
                true
            }
            None => false,
        };
        rest = rest.strip_prefix('/').unwrap_or(rest);

        let mut ascent = 0usize;
        loop {
            if let Some(stripped) = rest.strip_prefix("./") {
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix("../") {
                ascent += 1;
                rest = stripped;
            } else {
                break;
            }
        }
        if rest.is_empty() {
            continue;
        }

        let matcher = GlobBuilder::new(rest)
            .literal_separator(true)
            .build()
            .map_err(|err| InvalidPatternError {
                pattern: pattern.clone(),
                message: err.to_string(),
            })?
            .compile_matcher();
        steps.push(Step {
            negated,
            ascent,
            rest: rest.to_string(),
            matcher,
        });
    }
    Ok(steps)
}

fn has_wildcards(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', ']', '{', '}'])
}

fn walk_group(
    group_base: &Path,
    prefix: &str,
    steps: &[&Step],
    allow_usually_excluded: bool,
    matches: &mut BTreeMap<String, GlobEntry>,
) -> Result<()> {
    let walker = WalkDir::new(group_base)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            allow_usually_excluded
                || !entry.file_type().is_dir()
                || !is_usually_excluded(entry.file_name())
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // The walk can race deletions by the very scripts we manage.
            Err(err) if err.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => {
                continue;
            }
            Err(err) => return Err(err).with_context(|| format!("walk {group_base:?}")),
        };
        let relative = match entry.path().strip_prefix(group_base) {
            Ok(relative) => forward_slashes(relative),
            Err(_) => continue,
        };

        if included(steps, &relative) {
            let kind = classify(&entry.file_type());
            let relative = format!("{prefix}{relative}");
            matches.insert(
                relative.clone(),
                GlobEntry {
                    relative,
                    absolute: entry.path().to_path_buf(),
                    kind,
                },
            );
        }
    }
    Ok(())
}

/// All patterns in the group are literal paths: stat them directly
/// instead of walking the whole tree (ancestor lockfile patterns would
/// otherwise walk the entire repository per level).
fn probe_group(
    group_base: &Path,
    prefix: &str,
    steps: &[&Step],
    matches: &mut BTreeMap<String, GlobEntry>,
) -> Result<()> {
    for (index, step) in steps.iter().enumerate() {
        if step.negated {
            continue;
        }
        if !included(&steps[index..], &step.rest) {
            continue;
        }
        let absolute = group_base.join(&step.rest);
        let Ok(meta) = std::fs::symlink_metadata(&absolute) else {
            continue;
        };
        let relative = format!("{prefix}{}", step.rest);
        matches.insert(
            relative.clone(),
            GlobEntry {
                relative,
                absolute,
                kind: classify(&meta.file_type()),
            },
        );
    }
    Ok(())
}

fn included(steps: &[&Step], relative: &str) -> bool {
    let mut included = false;
    for step in steps {
        if step.matcher.is_match(relative) {
            included = !step.negated;
        }
    }
    included
}

fn is_usually_excluded(name: &std::ffi::OsStr) -> bool {
    USUALLY_EXCLUDED
        .iter()
        .any(|excluded| name == std::ffi::OsStr::new(excluded))
}

fn classify(file_type: &std::fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

fn forward_slashes(path: &Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
