//! Script execution.
//!
//! The executor walks the validated graph bottom-up: every script waits
//! for all of its dependencies, computes its fingerprint, and then takes
//! the cheapest path to done: skip when fresh, restore from cache when
//! possible, and only otherwise spawn the command under a worker-pool
//! permit. Executions are memoized per reference, so a diamond runs its
//! shared tail exactly once.
//!
//! Dependencies are deliberately launched in randomized order: nothing
//! beyond the declared edges orders scripts, and keeping launch order
//! unpredictable stops callers from relying on accidental ordering.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use derive_more::Display;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared, join_all},
};
use rand::seq::SliceRandom;
use tap::TapFallible;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::{Cache, CacheHit},
    coordinator::{Admission, FailureCoordinator},
    diagnostic::{Failure, FailureKind, Location},
    fingerprint::{self, Fingerprint},
    fs,
    glob::{self, GlobEntry, InvalidPatternError},
    logger::{Logger, OutputStream},
    pool::WorkerPool,
    script::{CleanPolicy, EnvValue, ScriptConfig, ScriptKey, ScriptReference},
    state::StateDir,
};

/// Why a script was skipped without running.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum SkipReason {
    /// Another script failed and the failure policy stops new work.
    #[display("a failure elsewhere stopped new work")]
    FailureElsewhere,
    /// The process was interrupted.
    #[display("interrupted")]
    Interrupted,
}

#[derive(Clone, Debug)]
pub enum ExecutionStatus {
    /// The script completed, by running, replaying a fresh state, or
    /// restoring from cache.
    Success {
        fingerprint: Fingerprint,
        fresh: bool,
        from_cache: bool,
    },
    /// Nothing to spawn: no command, or a service whose lifecycle an
    /// external supervisor owns.
    NoOp { fingerprint: Fingerprint },
    Failed { kind: FailureKind },
    Skipped { reason: SkipReason },
}

impl ExecutionStatus {
    /// The fingerprint, when the script completed successfully.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            ExecutionStatus::Success { fingerprint, .. }
            | ExecutionStatus::NoOp { fingerprint } => Some(fingerprint),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.fingerprint().is_some()
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub reference: ScriptReference,
    pub status: ExecutionStatus,
}

pub struct Executor<C: Cache> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: Cache> {
    pool: WorkerPool,
    coordinator: FailureCoordinator,
    cache: Option<C>,
    logger: Arc<dyn Logger>,
    executions: DashMap<ScriptKey, Shared<BoxFuture<'static, ExecutionResult>>>,
    failures: Mutex<Vec<Failure>>,
}

impl<C: Cache> Executor<C> {
    pub fn new(
        pool: WorkerPool,
        coordinator: FailureCoordinator,
        cache: Option<C>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                coordinator,
                cache,
                logger,
                executions: DashMap::new(),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Execute `script` and everything below it.
    pub async fn execute(&self, script: &Arc<ScriptConfig>) -> ExecutionResult {
        execution(&self.inner, script).await
    }

    /// Every execution failure recorded so far, in completion order.
    pub fn failures(&self) -> Vec<Failure> {
        lock_failures(&self.inner).clone()
    }
}

fn lock_failures<C: Cache>(inner: &Inner<C>) -> std::sync::MutexGuard<'_, Vec<Failure>> {
    inner
        .failures
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Memoized execution: repeated calls for the same reference share one
/// future (and therefore one invocation).
fn execution<C: Cache>(
    inner: &Arc<Inner<C>>,
    script: &Arc<ScriptConfig>,
) -> Shared<BoxFuture<'static, ExecutionResult>> {
    let key = script.key();
    if let Some(existing) = inner.executions.get(&key) {
        return existing.value().clone();
    }

    let future = run_script(Arc::clone(inner), Arc::clone(script))
        .boxed()
        .shared();
    match inner.executions.entry(key) {
        dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(future.clone());
            future
        }
    }
}

async fn run_script<C: Cache>(inner: Arc<Inner<C>>, script: Arc<ScriptConfig>) -> ExecutionResult {
    let status = match run(&inner, &script).await {
        Ok(status) => status,
        Err(failure) => {
            let kind = failure.kind;
            // Dependency failures propagate an existing latch; everything
            // else is a new failure the coordinator must see.
            if kind != FailureKind::DependencyFailed {
                inner.coordinator.record_failure();
            }
            warn!(script = %script.reference, %failure, "script failed");
            lock_failures(&inner).push(failure);
            ExecutionStatus::Failed { kind }
        }
    };
    ExecutionResult {
        reference: script.reference.clone(),
        status,
    }
}

#[instrument(skip_all, fields(script = %script.reference))]
async fn run<C: Cache>(
    inner: &Arc<Inner<C>>,
    script: &Arc<ScriptConfig>,
) -> Result<ExecutionStatus, Failure> {
    // 1. Dependencies first, all of them, in randomized launch order.
    //    Settlement-all: every dependency resolves before this script
    //    decides anything; failure propagation is policy-driven, not
    //    fail-fast.
    let mut dependencies = script.dependencies.clone();
    dependencies.shuffle(&mut rand::thread_rng());
    let results = join_all(
        dependencies
            .iter()
            .map(|dependency| execution(inner, &dependency.config)),
    )
    .await;

    let mut cascading = Vec::new();
    let mut cascading_failed = false;
    let mut skipped = false;
    for (dependency, result) in dependencies.iter().zip(&results) {
        match &result.status {
            ExecutionStatus::Success { fingerprint, .. }
            | ExecutionStatus::NoOp { fingerprint } => {
                if dependency.cascade {
                    cascading.push((dependency.config.key(), fingerprint.clone()));
                }
            }
            ExecutionStatus::Skipped { .. } => skipped = true,
            // A failed non-cascading dependency gates nothing further:
            // it completed (by failing), and its fingerprint never flows
            // into this script.
            ExecutionStatus::Failed { .. } => {
                if dependency.cascade {
                    cascading_failed = true;
                }
            }
        }
    }
    if cascading_failed {
        return Err(Failure::error(
            FailureKind::DependencyFailed,
            script.reference.clone(),
            "a dependency failed, so this script cannot run",
        ));
    }
    if skipped {
        return Ok(ExecutionStatus::Skipped {
            reason: skip_reason(&inner.coordinator),
        });
    }

    // 2. Fingerprint, bottom-up.
    let fingerprint = fingerprint::fingerprint(script, &cascading)
        .await
        .map_err(|err| glob_failure(script, err))?;

    // 3. Nothing to spawn: scripts without a command exist purely to
    //    group dependencies, and service lifecycles belong to an external
    //    supervisor.
    if script.command.is_none() || script.service.is_some() {
        debug!(script = %script.reference, "no command to run");
        return Ok(ExecutionStatus::NoOp { fingerprint });
    }

    let state = StateDir::new(&script.reference);
    let previous = match fingerprint.cacheable() {
        Some(_) => state
            .read_fingerprint()
            .await
            .map_err(|err| internal_failure(script, err))?,
        None => None,
    };

    // 4. Fresh: identical fingerprint means identical outputs. Replay
    //    and stop; outputs are not touched.
    if let (Some(current), Some(previous)) = (fingerprint.cacheable(), &previous) {
        if previous.canonical() == current.canonical() {
            info!(script = %script.reference, "fresh; skipping");
            replay(&state, inner.logger.as_ref())
                .await
                .map_err(|err| internal_failure(script, err))?;
            return Ok(ExecutionStatus::Success {
                fingerprint,
                fresh: true,
                from_cache: false,
            });
        }
    }

    // 5. We're going to change the world: drop the stored fingerprint
    //    before anything destructive, so dying mid-run can never leave a
    //    stale fingerprint claiming the outputs match.
    state
        .clear_fingerprint()
        .await
        .map_err(|err| internal_failure(script, err))?;

    let hit = match (&inner.cache, fingerprint.cacheable()) {
        (Some(cache), Some(current)) => cache
            .get(script, current)
            .await
            .map_err(|err| internal_failure(script, err))?,
        _ => None,
    };

    // 6. Clean stale output: always under `clean: true`, always ahead of
    //    a cache apply, and under "if-file-deleted" only when an input
    //    recorded by the previous fingerprint has disappeared.
    let clean_now = match script.clean {
        CleanPolicy::Always => true,
        CleanPolicy::Never => hit.is_some(),
        CleanPolicy::IfFileDeleted => {
            hit.is_some()
                || match (&previous, fingerprint.cacheable()) {
                    (Some(previous), Some(current)) => previous.any_input_deleted(current),
                    _ => false,
                }
        }
    };
    if clean_now {
        let outputs = expand_outputs(script).await?;
        for entry in &outputs {
            fs::remove_path(&entry.absolute)
                .await
                .map_err(|err| internal_failure(script, err))?;
        }
    }

    // 7. Cache hit: restore outputs and the captured streams, replay,
    //    and persist the fingerprint.
    if let Some(hit) = hit {
        info!(script = %script.reference, "restored from cache");
        // Stale captures from the previous run must not survive into the
        // restored state: an archive of a silent script has no replay
        // files to overwrite them with.
        state
            .reset_captures()
            .await
            .map_err(|err| internal_failure(script, err))?;
        hit.apply()
            .await
            .map_err(|err| internal_failure(script, err))?;
        replay(&state, inner.logger.as_ref())
            .await
            .map_err(|err| internal_failure(script, err))?;
        if let Some(current) = fingerprint.cacheable() {
            state
                .write_fingerprint(current)
                .await
                .map_err(|err| internal_failure(script, err))?;
        }
        return Ok(ExecutionStatus::Success {
            fingerprint,
            fresh: false,
            from_cache: true,
        });
    }

    // 8. Run the command under a pool permit. The admission check comes
    //    after acquiring: a permit freed at the instant a sibling fails
    //    must not admit new work under no-new.
    let permit = match inner.pool.acquire().await {
        Ok(permit) => permit,
        Err(_aborted) => {
            return Ok(ExecutionStatus::Skipped {
                reason: skip_reason(&inner.coordinator),
            });
        }
    };
    if inner.coordinator.admit() == Admission::Abort {
        drop(permit);
        return Ok(ExecutionStatus::Skipped {
            reason: skip_reason(&inner.coordinator),
        });
    }

    state
        .reset_captures()
        .await
        .map_err(|err| internal_failure(script, err))?;
    let exit = spawn_and_capture(inner, script, &state).await?;
    drop(permit);

    if !exit.success() {
        return Err(exit_failure(script, &exit));
    }

    // 9. Persist: save outputs to cache when possible, then write the
    //    fingerprint last, atomically.
    if let Some(current) = fingerprint.cacheable() {
        if script.output.is_some() {
            if let Some(cache) = &inner.cache {
                let outputs = expand_outputs(script).await?;
                // A cache save failure costs a future restore, not this
                // build.
                let _ = cache
                    .set(script, current, &outputs)
                    .await
                    .tap_err(|err| warn!(script = %script.reference, %err, "cache save failed"));
            }
        }
        state
            .write_fingerprint(current)
            .await
            .map_err(|err| internal_failure(script, err))?;
    }

    Ok(ExecutionStatus::Success {
        fingerprint,
        fresh: false,
        from_cache: false,
    })
}

fn skip_reason(coordinator: &FailureCoordinator) -> SkipReason {
    if coordinator.interrupted() {
        SkipReason::Interrupted
    } else {
        SkipReason::FailureElsewhere
    }
}

async fn replay(state: &StateDir, logger: &dyn Logger) -> Result<()> {
    state.replay(OutputStream::Stdout, logger).await?;
    state.replay(OutputStream::Stderr, logger).await?;
    Ok(())
}

/// Expand the output globs, asserting every match stays inside the
/// package directory. Scripts with no `output` key produce nothing here.
async fn expand_outputs(script: &ScriptConfig) -> Result<Vec<GlobEntry>, Failure> {
    let Some(patterns) = &script.output else {
        return Ok(Vec::new());
    };
    let entries = glob::resolve(
        &script.reference.package_dir,
        patterns,
        script.allow_usually_excluded_paths,
    )
    .await
    .map_err(|err| glob_failure(script, err))?;

    for entry in &entries {
        if !fs::is_within(&script.reference.package_dir, &entry.absolute) {
            let mut failure = Failure::error(
                FailureKind::OutputOutsidePackage,
                script.reference.clone(),
                format!(
                    "output path {:?} resolves outside the package directory",
                    entry.relative,
                ),
            );
            if let Some(span) = script.annotations.output {
                failure = failure.at(Location {
                    file: script.manifest.clone(),
                    span,
                });
            }
            return Err(failure);
        }
    }
    Ok(entries)
}

/// Spawn the command and tee its output to the logger and the capture
/// files, which are created lazily on the first byte.
async fn spawn_and_capture<C: Cache>(
    inner: &Arc<Inner<C>>,
    script: &Arc<ScriptConfig>,
    state: &StateDir,
) -> Result<std::process::ExitStatus, Failure> {
    let line = command_line(script);
    info!(script = %script.reference, command = %line, "running");

    let mut command = shell_command(&line);
    command
        .current_dir(&script.reference.package_dir)
        .env("PATH", rewritten_path_env(&script.reference.package_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (name, value) in &script.env {
        if let EnvValue::Literal(literal) = value {
            command.env(name, literal);
        }
    }

    let mut child = command.spawn().map_err(|err| {
        Failure::error(
            FailureKind::SpawnError,
            script.reference.clone(),
            format!("failed to spawn command: {err}"),
        )
    })?;

    let registration = child.id().map(|pid| inner.coordinator.register_child(pid));

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let tee_out = tee(
        stdout,
        OutputStream::Stdout,
        state,
        &script.reference,
        &inner.logger,
    );
    let tee_err = tee(
        stderr,
        OutputStream::Stderr,
        state,
        &script.reference,
        &inner.logger,
    );

    let exit = child
        .wait()
        .await
        .map_err(|err| internal_failure(script, err.into()));
    for task in [tee_out, tee_err] {
        if let Err(err) = task.await.context("join capture task").and_then(|r| r) {
            warn!(script = %script.reference, %err, "output capture failed");
        }
    }
    drop(registration);
    exit
}

fn tee(
    stream: Option<impl AsyncReadExt + Unpin + Send + 'static>,
    which: OutputStream,
    state: &StateDir,
    reference: &ScriptReference,
    logger: &Arc<dyn Logger>,
) -> tokio::task::JoinHandle<Result<()>> {
    let mut sink = state.capture(which);
    let reference = reference.clone();
    let logger = Arc::clone(logger);
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return Ok(());
        };
        let mut buffer = vec![0u8; 8 * 1024];
        loop {
            let read = stream.read(&mut buffer).await.context("read child output")?;
            if read == 0 {
                return Ok(());
            }
            logger.output(&reference, which, &buffer[..read]);
            sink.write(&buffer[..read]).await?;
        }
    })
}

fn exit_failure(script: &ScriptConfig, exit: &std::process::ExitStatus) -> Failure {
    match exit.code() {
        Some(code) => Failure::error(
            FailureKind::ExitNonZero,
            script.reference.clone(),
            format!("command exited with code {code}"),
        ),
        None => {
            #[cfg(unix)]
            let detail = {
                use std::os::unix::process::ExitStatusExt;
                exit.signal()
                    .map(|signal| format!("command was terminated by signal {signal}"))
            };
            #[cfg(not(unix))]
            let detail: Option<String> = None;
            Failure::error(
                FailureKind::Signaled,
                script.reference.clone(),
                detail.unwrap_or_else(|| String::from("command was terminated by a signal")),
            )
        }
    }
}

fn glob_failure(script: &ScriptConfig, err: color_eyre::Report) -> Failure {
    match err.downcast_ref::<InvalidPatternError>() {
        Some(invalid) => Failure::error(
            FailureKind::InvalidConfigSyntax,
            script.reference.clone(),
            invalid.to_string(),
        ),
        None => internal_failure(script, err),
    }
}

/// An unexpected infrastructure error (filesystem, task join). There is
/// no dedicated taxonomy entry for these; they surface as a spawn-level
/// failure carrying the full error chain.
fn internal_failure(script: &ScriptConfig, err: color_eyre::Report) -> Failure {
    Failure::error(
        FailureKind::SpawnError,
        script.reference.clone(),
        format!("internal error: {err:#}"),
    )
}

/// The command string handed to the shell: the configured command plus
/// any trailing extra arguments, quoted.
fn command_line(script: &ScriptConfig) -> String {
    let mut line = script.command.clone().unwrap_or_default();
    for arg in &script.extra_args {
        line.push(' ');
        line.push_str(&quote_posix(arg));
    }
    line
}

fn quote_posix(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(unix)]
fn shell_command(line: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell_command(line: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

/// Rewrite PATH so scripts see their package's `node_modules/.bin` (and
/// each ancestor's) first, and do not see whatever package-local bins the
/// invoking shell happened to have at the front.
fn rewritten_path_env(package_dir: &Path) -> OsString {
    let mut paths: Vec<PathBuf> = package_dir
        .ancestors()
        .map(|dir| dir.join("node_modules").join(".bin"))
        .collect();

    let inherited = std::env::var_os("PATH");
    if let Some(inherited) = &inherited {
        paths.extend(
            std::env::split_paths(inherited)
                .skip_while(|entry| entry.ends_with("node_modules/.bin")),
        );
    }

    match std::env::join_paths(paths) {
        Ok(joined) => joined,
        // A pathological entry (embedded separator) keeps the inherited
        // PATH rather than producing an empty one.
        Err(_) => inherited.unwrap_or_default(),
    }
}
