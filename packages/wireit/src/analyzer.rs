//! Script graph construction and validation.
//!
//! Analysis happens in two traversals:
//!
//! 1. A non-deterministic parallel fan-out that reads manifests, validates
//!    each script's configuration, and wires dependency edges to
//!    *placeholder* nodes. Placeholders let a node be referenced before
//!    its own config is known, which is what makes cyclic input safe to
//!    construct: nothing in this phase ever waits on a dependency's
//!    upgrade.
//! 2. A deterministic depth-first walk that sorts dependency lists
//!    canonically, detects cycles with a stable trail, and converts the
//!    upgraded nodes into the immutable [`ScriptConfig`] graph.
//!
//! Failures are collected, not short-circuited: one analysis reports every
//! problem it can find, with superseded duplicates filtered at the end.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use color_eyre::{Result, eyre::Context};
use tokio::task::JoinHandle;
use tracing::{instrument, trace};

use crate::{
    diagnostic::{self, Annotation, Failure, FailureKind, Location, Span},
    fs,
    manifest::{
        self, Package, PackageReader, WIREIT_COMMAND, WIREIT_COMMAND_YARN_ALIAS,
        ast::{Entry, Node},
    },
    script::{
        CleanPolicy, Dependency, EnvValue, ScriptAnnotations, ScriptConfig, ScriptKey,
        ScriptReference, ServiceConfig,
    },
};

/// The result of analyzing a root script.
#[derive(Clone, Debug)]
pub enum AnalysisOutcome {
    /// The entire transitive closure validated and is acyclic. Warnings
    /// (e.g. an ignored wireit config) ride along for the caller to
    /// print.
    Valid {
        config: Arc<ScriptConfig>,
        warnings: Vec<Failure>,
    },
    /// Every problem found, deduplicated and deterministically ordered.
    Invalid(Vec<Failure>),
}

/// Analyze the graph rooted at `root`.
///
/// `extra_args` are trailing command-line arguments, applied to the root
/// script only.
#[instrument(skip(reader, extra_args), fields(root = %root))]
pub async fn analyze(
    reader: Arc<PackageReader>,
    root: &ScriptReference,
    extra_args: &[String],
) -> Result<AnalysisOutcome> {
    let shared = Arc::new(Shared {
        reader,
        nodes: Mutex::new(HashMap::new()),
        pending: Mutex::new(Vec::new()),
        failures: Mutex::new(Vec::new()),
    });

    let root_node = shared.placeholder(root.clone());

    // Drain the upgrade queue to empty. Upgrades spawn further upgrades
    // as they discover new references, so this loops until a pass finds
    // nothing left to join.
    loop {
        let batch: Vec<JoinHandle<()>> = {
            let mut pending = lock(&shared.pending);
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            break;
        }
        for handle in batch {
            handle.await.context("join upgrade task")?;
        }
    }

    // Deterministic pass: cycle check, canonical sort, graph build.
    let mut builder = Builder {
        shared: &shared,
        trail: Vec::new(),
        trail_index: HashMap::new(),
    };
    let root_config = builder.check(&root_node, Some(extra_args));

    let failures = diagnostic::finalize(std::mem::take(&mut *lock(&shared.failures)));
    let errors = failures
        .iter()
        .any(|failure| failure.severity == diagnostic::Severity::Error);
    match root_config {
        Some(config) if !errors => Ok(AnalysisOutcome::Valid {
            config,
            warnings: failures,
        }),
        _ => Ok(AnalysisOutcome::Invalid(failures)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Upgrade tasks never panic while holding these locks; a poisoned
    // lock here means analysis state is unrecoverable anyway.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    reader: Arc<PackageReader>,
    /// The placeholder table. `placeholder` is the sole allocator; first
    /// writer wins and subsequent lookups return the same handle.
    nodes: Mutex<HashMap<ScriptKey, Arc<ScriptNode>>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    failures: Mutex<Vec<Failure>>,
}

impl Shared {
    fn placeholder(self: &Arc<Self>, reference: ScriptReference) -> Arc<ScriptNode> {
        let mut nodes = lock(&self.nodes);
        if let Some(existing) = nodes.get(&reference.key()) {
            return Arc::clone(existing);
        }

        let node = Arc::new(ScriptNode {
            reference: reference.clone(),
            state: RwLock::new(NodeState::Unvalidated(None)),
        });
        nodes.insert(reference.key(), Arc::clone(&node));

        let task = tokio::spawn(upgrade(Arc::clone(self), Arc::clone(&node)));
        lock(&self.pending).push(task);
        node
    }

    fn report(&self, failure: Failure) {
        lock(&self.failures).push(failure);
    }

    fn report_all(&self, failures: Vec<Failure>) {
        lock(&self.failures).extend(failures);
    }
}

/// A graph node. The handle never changes identity: other nodes hold
/// references to it before its config is known, so state transitions
/// mutate in place.
#[derive(Debug)]
struct ScriptNode {
    reference: ScriptReference,
    state: RwLock<NodeState>,
}

#[derive(Clone, Debug)]
enum NodeState {
    /// Placeholder, or terminal when phase 1 found the node unusable.
    Unvalidated(Option<TerminalReason>),
    /// Config parsed; dependencies are placeholders.
    LocallyValid(LocalConfig),
    /// Entire transitive closure is locally valid and acyclic.
    Valid(Arc<ScriptConfig>),
    /// A dependency (or a cycle through this node) is invalid.
    Invalid,
}

/// Why a node never became locally valid. Dependents use this to pick the
/// richer edge-level failure kind during phase 2.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum TerminalReason {
    MissingPackage,
    InvalidPackage,
    ScriptNotFound,
    BadConfig,
}

#[derive(Clone, Debug)]
struct LocalConfig {
    manifest: PathBuf,
    command: Option<String>,
    dependencies: Vec<LocalDependency>,
    files: Option<Vec<String>>,
    output: Option<Vec<String>>,
    clean: CleanPolicy,
    service: Option<ServiceConfig>,
    env: BTreeMap<String, EnvValue>,
    package_locks: Vec<String>,
    allow_usually_excluded_paths: bool,
    annotations: ScriptAnnotations,
}

#[derive(Clone, Debug)]
struct LocalDependency {
    node: Arc<ScriptNode>,
    cascade: bool,
    /// Where the dependency was declared, for diagnostics.
    location: Location,
}

/// Phase 1: read the node's manifest, validate its config shape, resolve
/// dependency specifiers to placeholders, and upgrade the node in place.
/// Never waits on another node's upgrade.
#[instrument(skip_all, fields(script = %node.reference))]
async fn upgrade(shared: Arc<Shared>, node: Arc<ScriptNode>) {
    let package = shared.reader.read(&node.reference.package_dir).await;
    shared.report_all(package.reportable_failures(&node.reference));

    let state = validate(&shared, &node, &package).await;
    let mut slot = node
        .state
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = state;
}

async fn validate(shared: &Arc<Shared>, node: &ScriptNode, package: &Package) -> NodeState {
    let reference = &node.reference;
    let Some(contents) = &package.contents else {
        let reason = match package.file_issue() {
            Some(manifest::FileIssue::Missing) => TerminalReason::MissingPackage,
            _ => TerminalReason::InvalidPackage,
        };
        return NodeState::Unvalidated(Some(reason));
    };

    let info = package.script_info(&reference.name);
    let Some(script_entry) = info.script else {
        let mut failure = Failure::error(
            FailureKind::ScriptNotFound,
            reference.clone(),
            format!(
                "script \"{}\" was not found in the scripts section of {}",
                reference.name,
                package.manifest.display(),
            ),
        );
        if let Some(wireit_entry) = info.wireit {
            failure = failure.at(Location {
                file: package.manifest.clone(),
                span: wireit_entry.key.span,
            });
        }
        shared.report(failure);
        return NodeState::Unvalidated(Some(TerminalReason::ScriptNotFound));
    };

    let Some(script_command) = script_entry.value.as_string() else {
        shared.report(
            Failure::error(
                FailureKind::InvalidConfigSyntax,
                reference.clone(),
                "script value must be a string",
            )
            .at(Location {
                file: package.manifest.clone(),
                span: script_entry.value.span(),
            }),
        );
        return NodeState::Unvalidated(Some(TerminalReason::BadConfig));
    };

    let is_sentinel = script_command.value == WIREIT_COMMAND
        || script_command.value == WIREIT_COMMAND_YARN_ALIAS;

    let mut validator = Validator {
        shared,
        package,
        reference,
        failed: false,
    };

    match (is_sentinel, info.wireit) {
        (true, Some(wireit_entry)) => validator.wireit_config(contents, wireit_entry).await,
        (true, None) => {
            validator.syntax_error(
                format!(
                    "script \"{}\" is configured to run wireit, but has no config in the wireit section",
                    reference.name,
                ),
                script_entry.value.span(),
            );
            NodeState::Unvalidated(Some(TerminalReason::BadConfig))
        }
        (false, maybe_wireit) => {
            if maybe_wireit.is_some() {
                shared.report(
                    Failure::warning(
                        FailureKind::ScriptNotWireit,
                        reference.clone(),
                        format!(
                            "script \"{}\" has a wireit config, but the script does not run wireit; the config is ignored",
                            reference.name,
                        ),
                    )
                    .at(Location {
                        file: package.manifest.clone(),
                        span: script_entry.value.span(),
                    }),
                );
            }
            validator.plain_script(script_command.value.clone(), script_entry.value.span())
        }
    }
}

/// Per-script validation context for phase 1.
struct Validator<'a> {
    shared: &'a Arc<Shared>,
    package: &'a Package,
    reference: &'a ScriptReference,
    failed: bool,
}

impl Validator<'_> {
    fn location(&self, span: Span) -> Location {
        Location {
            file: self.package.manifest.clone(),
            span,
        }
    }

    fn syntax_error(&mut self, message: impl Into<String>, span: Span) {
        self.failed = true;
        self.shared.report(
            Failure::error(
                FailureKind::InvalidConfigSyntax,
                self.reference.clone(),
                message,
            )
            .at(self.location(span)),
        );
    }

    /// A script whose command doesn't hand over to wireit still runs
    /// through the graph, with no declared inputs or dependencies.
    fn plain_script(&mut self, command: String, span: Span) -> NodeState {
        if command.is_empty() {
            self.syntax_error("script command must not be empty", span);
            return NodeState::Unvalidated(Some(TerminalReason::BadConfig));
        }
        NodeState::LocallyValid(LocalConfig {
            manifest: self.package.manifest.clone(),
            command: Some(command),
            dependencies: Vec::new(),
            files: None,
            output: None,
            clean: CleanPolicy::default(),
            service: None,
            env: BTreeMap::new(),
            package_locks: Vec::new(),
            allow_usually_excluded_paths: false,
            annotations: ScriptAnnotations {
                command: Some(span),
                ..ScriptAnnotations::default()
            },
        })
    }

    async fn wireit_config(
        &mut self,
        contents: &manifest::PackageContents,
        wireit_entry: &Entry,
    ) -> NodeState {
        let Some(config) = wireit_entry.value.as_object() else {
            self.syntax_error("wireit config must be an object", wireit_entry.value.span());
            return NodeState::Unvalidated(Some(TerminalReason::BadConfig));
        };

        let mut annotations = ScriptAnnotations::default();

        let command = match config.get("command") {
            Some(entry) => {
                annotations.command = Some(entry.value.span());
                match entry.value.as_string() {
                    Some(command) if !command.value.is_empty() => Some(command.value.clone()),
                    _ => {
                        self.syntax_error(
                            "\"command\" must be a non-empty string",
                            entry.value.span(),
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let declared = self.declared_dependencies(config);
        let files = self.string_array(config, "files", &mut annotations.files);
        let output = self.string_array(config, "output", &mut annotations.output);
        let clean = self.clean_policy(config);
        let service = self.service_config(config, &mut annotations.service);
        let env = self.env_section(config);
        let package_locks = self.package_locks(config);
        let allow_usually_excluded_paths = match config.get("allowUsuallyExcludedPaths") {
            Some(entry) => match entry.value.as_bool() {
                Some(node) => node.value,
                None => {
                    self.syntax_error(
                        "\"allowUsuallyExcludedPaths\" must be a boolean",
                        entry.value.span(),
                    );
                    false
                }
            },
            None => false,
        };

        // Cross-field rules key off whether "command" was *declared*: a
        // declared-but-invalid command already has its own report.
        let command_declared = config.get("command").is_some();
        if !command_declared && config.get("dependencies").is_none() && config.get("files").is_none()
        {
            self.syntax_error(
                "a wireit config must set at least one of \"command\", \"dependencies\", or \"files\"",
                wireit_entry.value.span(),
            );
        }
        if output.is_some() && !command_declared {
            self.syntax_error(
                "\"output\" requires a \"command\"",
                annotations.output.unwrap_or(wireit_entry.value.span()),
            );
        }
        if let Some(span) = annotations.service {
            if service.is_some() && !command_declared {
                self.syntax_error("a service must have a \"command\"", span);
            }
            if service.is_some() && output.is_some() {
                self.syntax_error("a service must not have \"output\"", span);
            }
        }

        let dependencies = self.resolve_dependencies(contents, declared).await;

        if self.failed {
            return NodeState::Unvalidated(Some(TerminalReason::BadConfig));
        }

        // Amend files with lockfile patterns at every ancestor depth, so
        // dependency installs invalidate fingerprints. An explicit empty
        // packageLocks array disables this.
        let files = files.map(|mut files| {
            if !package_locks.is_empty() {
                let depths = self.reference.package_dir.ancestors().count();
                for lock in &package_locks {
                    for depth in 0..depths {
                        files.push(format!("{}{lock}", "../".repeat(depth)));
                    }
                }
            }
            files
        });

        NodeState::LocallyValid(LocalConfig {
            manifest: self.package.manifest.clone(),
            command,
            dependencies,
            files,
            output,
            clean,
            service,
            env,
            package_locks,
            allow_usually_excluded_paths,
            annotations,
        })
    }

    fn declared_dependencies(&mut self, config: &manifest::ast::ObjectNode) -> Vec<DeclaredDep> {
        let Some(entry) = config.get("dependencies") else {
            return Vec::new();
        };
        let Some(array) = entry.value.as_array() else {
            self.syntax_error("\"dependencies\" must be an array", entry.value.span());
            return Vec::new();
        };

        let mut declared = Vec::new();
        for element in &array.elements {
            match element {
                Node::String(specifier) => {
                    if specifier.value.is_empty() {
                        self.syntax_error("dependency must not be empty", specifier.span);
                        continue;
                    }
                    declared.push(DeclaredDep {
                        specifier: specifier.value.clone(),
                        cascade: true,
                        span: specifier.span,
                    });
                }
                Node::Object(object) => {
                    let Some(script) = object.get_value("script").and_then(Node::as_string) else {
                        self.syntax_error(
                            "a dependency object must have a \"script\" string",
                            object.span,
                        );
                        continue;
                    };
                    if script.value.is_empty() {
                        self.syntax_error("dependency must not be empty", script.span);
                        continue;
                    }
                    let cascade = match object.get_value("cascade") {
                        Some(node) => match node.as_bool() {
                            Some(cascade) => cascade.value,
                            None => {
                                self.syntax_error("\"cascade\" must be a boolean", node.span());
                                true
                            }
                        },
                        None => true,
                    };
                    declared.push(DeclaredDep {
                        specifier: script.value.clone(),
                        cascade,
                        span: script.span,
                    });
                }
                other => {
                    self.syntax_error(
                        format!(
                            "dependency must be a string or an object, got {}",
                            other.type_name(),
                        ),
                        other.span(),
                    );
                }
            }
        }
        declared
    }

    fn string_array(
        &mut self,
        config: &manifest::ast::ObjectNode,
        key: &str,
        span_slot: &mut Option<Span>,
    ) -> Option<Vec<String>> {
        let entry = config.get(key)?;
        *span_slot = Some(entry.value.span());
        let Some(array) = entry.value.as_array() else {
            self.syntax_error(format!("\"{key}\" must be an array"), entry.value.span());
            return None;
        };

        let mut values = Vec::with_capacity(array.elements.len());
        for element in &array.elements {
            match element.as_string() {
                Some(value) if !value.value.is_empty() => values.push(value.value.clone()),
                _ => self.syntax_error(
                    format!("\"{key}\" entries must be non-empty strings"),
                    element.span(),
                ),
            }
        }
        Some(values)
    }

    fn clean_policy(&mut self, config: &manifest::ast::ObjectNode) -> CleanPolicy {
        let Some(entry) = config.get("clean") else {
            return CleanPolicy::default();
        };
        match &entry.value {
            Node::Bool(node) if node.value => CleanPolicy::Always,
            Node::Bool(_) => CleanPolicy::Never,
            Node::String(node) if node.value == "if-file-deleted" => CleanPolicy::IfFileDeleted,
            other => {
                self.syntax_error(
                    "\"clean\" must be true, false, or \"if-file-deleted\"",
                    other.span(),
                );
                CleanPolicy::default()
            }
        }
    }

    fn service_config(
        &mut self,
        config: &manifest::ast::ObjectNode,
        span_slot: &mut Option<Span>,
    ) -> Option<ServiceConfig> {
        let entry = config.get("service")?;
        *span_slot = Some(entry.value.span());
        match &entry.value {
            Node::Bool(node) => node.value.then(ServiceConfig::default),
            Node::Object(object) => {
                let ready_when_line_matches = match object.get_value("readyWhen") {
                    Some(Node::Object(ready)) => match ready.get_value("lineMatches") {
                        Some(Node::String(pattern)) => Some(pattern.value.clone()),
                        Some(other) => {
                            self.syntax_error("\"lineMatches\" must be a string", other.span());
                            None
                        }
                        None => None,
                    },
                    Some(other) => {
                        self.syntax_error("\"readyWhen\" must be an object", other.span());
                        None
                    }
                    None => None,
                };
                Some(ServiceConfig {
                    ready_when_line_matches,
                })
            }
            other => {
                self.syntax_error("\"service\" must be a boolean or an object", other.span());
                None
            }
        }
    }

    fn env_section(&mut self, config: &manifest::ast::ObjectNode) -> BTreeMap<String, EnvValue> {
        let Some(entry) = config.get("env") else {
            return BTreeMap::new();
        };
        let Some(object) = entry.value.as_object() else {
            self.syntax_error("\"env\" must be an object", entry.value.span());
            return BTreeMap::new();
        };

        let mut env = BTreeMap::new();
        for entry in &object.entries {
            let value = match &entry.value {
                Node::String(literal) => EnvValue::Literal(literal.value.clone()),
                Node::Object(spec) => {
                    let external = spec
                        .get_value("external")
                        .and_then(Node::as_bool)
                        .is_some_and(|node| node.value);
                    if !external {
                        self.syntax_error(
                            "an env object must set \"external\": true",
                            spec.span,
                        );
                        continue;
                    }
                    let default = match spec.get_value("default") {
                        Some(Node::String(default)) => Some(default.value.clone()),
                        Some(other) => {
                            self.syntax_error("\"default\" must be a string", other.span());
                            None
                        }
                        None => None,
                    };
                    EnvValue::External { default }
                }
                other => {
                    self.syntax_error(
                        "env entries must be strings or {\"external\": true} objects",
                        other.span(),
                    );
                    continue;
                }
            };
            env.insert(entry.key.value.clone(), value);
        }
        env
    }

    fn package_locks(&mut self, config: &manifest::ast::ObjectNode) -> Vec<String> {
        let Some(entry) = config.get("packageLocks") else {
            return vec![String::from("package-lock.json")];
        };
        let Some(array) = entry.value.as_array() else {
            self.syntax_error("\"packageLocks\" must be an array", entry.value.span());
            return Vec::new();
        };

        let mut locks = Vec::new();
        for element in &array.elements {
            match element.as_string() {
                Some(name)
                    if !name.value.is_empty()
                        && !name.value.contains('/')
                        && !name.value.contains('\\') =>
                {
                    locks.push(name.value.clone());
                }
                _ => self.syntax_error(
                    "\"packageLocks\" entries must be filenames without path separators",
                    element.span(),
                ),
            }
        }
        locks
    }

    /// Resolve specifier strings to placeholder edges. Placeholders for
    /// newly discovered references start their own upgrades; this never
    /// waits on them.
    async fn resolve_dependencies(
        &mut self,
        contents: &manifest::PackageContents,
        declared: Vec<DeclaredDep>,
    ) -> Vec<LocalDependency> {
        let mut resolved: Vec<LocalDependency> = Vec::new();
        let mut first_occurrence: HashMap<ScriptKey, Span> = HashMap::new();

        for dep in declared {
            let targets = self.resolve_specifier(contents, &dep).await;
            for target in targets {
                let key = target.key();
                if let Some(first) = first_occurrence.get(&key) {
                    self.failed = true;
                    self.shared.report(
                        Failure::error(
                            FailureKind::DuplicateDependency,
                            self.reference.clone(),
                            format!("dependency \"{}\" is listed more than once", dep.specifier),
                        )
                        .at(self.location(dep.span))
                        .with_supplemental(Annotation {
                            message: String::from("first listed here"),
                            location: Some(self.location(*first)),
                        }),
                    );
                    continue;
                }
                first_occurrence.insert(key, dep.span);
                resolved.push(LocalDependency {
                    node: self.shared.placeholder(target),
                    cascade: dep.cascade,
                    location: self.location(dep.span),
                });
            }
        }
        resolved
    }

    async fn resolve_specifier(
        &mut self,
        contents: &manifest::PackageContents,
        dep: &DeclaredDep,
    ) -> Vec<ScriptReference> {
        let specifier = dep.specifier.as_str();
        let package_dir = &self.reference.package_dir;

        if let Some(name) = specifier.strip_prefix("<dependencies>#") {
            if name.is_empty() {
                self.syntax_error("dependency script name must not be empty", dep.span);
                return Vec::new();
            }
            let mut expanded = Vec::new();
            for package_name in &contents.dependencies {
                let Some(dir) = find_installed_package(package_dir, package_name).await else {
                    continue;
                };
                let package = self.shared.reader.read(&dir).await;
                let has_script = package
                    .contents
                    .as_ref()
                    .is_some_and(|_| package.script_info(name).script.is_some());
                if has_script {
                    expanded.push(ScriptReference::new(dir, name));
                }
            }
            if expanded.is_empty() {
                self.syntax_error(
                    format!(
                        "no package dependency has a script named \"{name}\"",
                    ),
                    dep.span,
                );
            }
            return expanded;
        }

        if specifier.starts_with("./") || specifier.starts_with("../") {
            let (path, name) = match split_cross_package(specifier) {
                Some(parts) => parts,
                None => {
                    self.syntax_error(
                        "a cross-package dependency must use the form \"./path#scriptName\"",
                        dep.span,
                    );
                    return Vec::new();
                }
            };
            if name.is_empty() {
                self.syntax_error("dependency script name must not be empty", dep.span);
                return Vec::new();
            }
            let target_dir = fs::normalize_lexically(&package_dir.join(path));
            if target_dir == *package_dir {
                self.syntax_error(
                    "a cross-package dependency must be in a different package; use the plain script name instead",
                    dep.span,
                );
                return Vec::new();
            }
            return vec![ScriptReference::new(target_dir, name)];
        }

        vec![ScriptReference::new(package_dir.clone(), specifier)]
    }
}

/// Split a `./path#name` (or historical `./path:name`) specifier.
/// `#` wins when both separators appear.
fn split_cross_package(specifier: &str) -> Option<(&str, &str)> {
    if let Some(index) = specifier.find('#') {
        return Some((&specifier[..index], &specifier[index + 1..]));
    }
    // The historical `:` form is ambiguous with script names containing
    // `:`; the first separator after the path prefix is taken, matching
    // how these specifiers were read before `#` superseded them.
    specifier
        .find(':')
        .map(|index| (&specifier[..index], &specifier[index + 1..]))
}

async fn find_installed_package(from: &Path, package_name: &str) -> Option<PathBuf> {
    for ancestor in from.ancestors() {
        let candidate = ancestor.join("node_modules").join(package_name);
        if matches!(fs::symlink_metadata(&candidate).await, Ok(Some(_))) {
            return Some(candidate);
        }
    }
    None
}

#[derive(Clone, Debug)]
struct DeclaredDep {
    specifier: String,
    cascade: bool,
    span: Span,
}

/// Phase 2: deterministic cycle check and graph build.
struct Builder<'a> {
    shared: &'a Arc<Shared>,
    trail: Vec<TrailEntry>,
    trail_index: HashMap<ScriptKey, usize>,
}

struct TrailEntry {
    node: Arc<ScriptNode>,
    /// The edge currently being explored out of this node.
    outgoing: Option<Location>,
}

impl Builder<'_> {
    /// Validate `node` and everything below it, returning its immutable
    /// config. `None` means a failure was reported somewhere beneath.
    fn check(
        &mut self,
        node: &Arc<ScriptNode>,
        extra_args: Option<&[String]>,
    ) -> Option<Arc<ScriptConfig>> {
        let local = {
            let state = node
                .state
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match &*state {
                NodeState::Valid(config) => return Some(Arc::clone(config)),
                NodeState::Invalid | NodeState::Unvalidated(_) => return None,
                NodeState::LocallyValid(local) => local.clone(),
            }
        };

        let key = node.reference.key();
        self.trail_index.insert(key.clone(), self.trail.len());
        self.trail.push(TrailEntry {
            node: Arc::clone(node),
            outgoing: None,
        });

        // Canonical order: identical graphs produce identical walks, so
        // cycle trails and fingerprints are stable no matter how the
        // manifest declared its dependencies.
        let mut ordered = local.dependencies.clone();
        ordered.sort_by(|a, b| {
            (&a.node.reference.package_dir, &a.node.reference.name)
                .cmp(&(&b.node.reference.package_dir, &b.node.reference.name))
        });

        let mut edges = Vec::with_capacity(ordered.len());
        let mut bad_edge: Option<Location> = None;
        let mut reported_for_node = false;
        let mut in_cycle = false;

        for dep in &ordered {
            let dep_key = dep.node.reference.key();
            if let Some(&start) = self.trail_index.get(&dep_key) {
                self.set_outgoing(dep.location.clone());
                self.report_cycle(start);
                in_cycle = true;
                continue;
            }

            let dep_terminal = {
                let state = read_state(&dep.node);
                match &*state {
                    NodeState::Unvalidated(reason) => Some(*reason),
                    NodeState::Invalid => Some(None),
                    _ => None,
                }
            };
            if let Some(reason) = dep_terminal {
                reported_for_node |= self.report_edge_failure(node, dep, reason);
                bad_edge.get_or_insert(dep.location.clone());
                continue;
            }

            self.set_outgoing(dep.location.clone());
            match self.check(&dep.node, None) {
                Some(config) => edges.push(Dependency {
                    config,
                    cascade: dep.cascade,
                }),
                None => {
                    bad_edge.get_or_insert(dep.location.clone());
                }
            }
        }

        self.trail.pop();
        self.trail_index.remove(&key);

        // A cycle through this node already reported it (and marked it
        // invalid); don't pile a dependency failure on top.
        if in_cycle || matches!(&*read_state(node), NodeState::Invalid) {
            set_state(node, NodeState::Invalid);
            return None;
        }

        if let Some(location) = bad_edge {
            // One dependency-invalid per node, and only when no richer
            // edge failure already names this node.
            if !reported_for_node {
                self.shared.report(
                    Failure::error(
                        FailureKind::DependencyInvalid,
                        node.reference.clone(),
                        "a dependency of this script is invalid",
                    )
                    .at(location),
                );
            }
            set_state(node, NodeState::Invalid);
            return None;
        }

        let config = Arc::new(ScriptConfig {
            reference: node.reference.clone(),
            manifest: local.manifest,
            command: local.command,
            extra_args: extra_args.map(<[String]>::to_vec).unwrap_or_default(),
            dependencies: edges,
            files: local.files,
            output: local.output,
            clean: local.clean,
            service: local.service,
            env: local.env,
            package_locks: local.package_locks,
            allow_usually_excluded_paths: local.allow_usually_excluded_paths,
            annotations: local.annotations,
        });
        set_state(node, NodeState::Valid(Arc::clone(&config)));
        Some(config)
    }

    fn set_outgoing(&mut self, location: Location) {
        if let Some(last) = self.trail.last_mut() {
            last.outgoing = Some(location);
        }
    }

    /// Report the cycle closing at `trail[start]`, enumerating every edge
    /// in declaration location order, and mark every participant invalid.
    fn report_cycle(&mut self, start: usize) {
        let cycle = &self.trail[start..];
        let first = &cycle[0].node.reference;

        let mut supplemental = Vec::with_capacity(cycle.len());
        for (index, entry) in cycle.iter().enumerate() {
            let from = &entry.node.reference;
            let (to, closes) = match cycle.get(index + 1) {
                Some(next) => (&next.node.reference, false),
                None => (first, true),
            };
            let message = if closes {
                format!("\"{}\" points back to \"{}\"", from.name, to.name)
            } else {
                format!("\"{}\" points to \"{}\"", from.name, to.name)
            };
            supplemental.push(Annotation {
                message,
                location: entry.outgoing.clone(),
            });
        }

        self.shared.report(Failure {
            kind: FailureKind::Cycle,
            severity: diagnostic::Severity::Error,
            script: first.clone(),
            message: format!("cycle detected in the dependencies of \"{}\"", first.name),
            location: cycle[0].outgoing.clone(),
            supplemental,
            supersedes: None,
        });

        for entry in &self.trail[start..] {
            set_state(&entry.node, NodeState::Invalid);
        }
        trace!(start = %first, "cycle reported");
    }

    /// A dependency that never became locally valid gets an edge-flavored
    /// failure pointing at the specifier that declared it; the richer
    /// variants supersede the file-level report. Returns whether a
    /// failure naming this node was emitted.
    fn report_edge_failure(
        &self,
        node: &Arc<ScriptNode>,
        dep: &LocalDependency,
        reason: Option<TerminalReason>,
    ) -> bool {
        let target = &dep.node.reference;
        match reason {
            Some(TerminalReason::MissingPackage) => {
                self.shared.report(
                    Failure::error(
                        FailureKind::DependencyOnMissingPackageJson,
                        node.reference.clone(),
                        format!(
                            "dependency points at {}, which has no package.json",
                            target.package_dir.display(),
                        ),
                    )
                    .at(dep.location.clone())
                    .superseding(Failure::identity_of(
                        FailureKind::MissingPackageJson,
                        target,
                    )),
                );
                true
            }
            Some(TerminalReason::ScriptNotFound) => {
                self.shared.report(
                    Failure::error(
                        FailureKind::DependencyOnMissingScript,
                        node.reference.clone(),
                        format!(
                            "dependency points at script \"{}\", which does not exist in {}",
                            target.name,
                            target.package_dir.display(),
                        ),
                    )
                    .at(dep.location.clone())
                    .superseding(Failure::identity_of(FailureKind::ScriptNotFound, target)),
                );
                true
            }
            // The dependency's own failure was already reported; the
            // caller records a single dependency-invalid for this node.
            Some(TerminalReason::InvalidPackage) | Some(TerminalReason::BadConfig) | None => false,
        }
    }
}

fn read_state(node: &ScriptNode) -> std::sync::RwLockReadGuard<'_, NodeState> {
    node.state
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_state(node: &ScriptNode, state: NodeState) {
    let mut slot = node
        .state
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = state;
}
