//! The binary entrypoint for `wireit`, the incremental script runner.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand, crate_version};
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tracing::warn;
use tracing_subscriber::util::SubscriberInitExt;

use wireit::{
    analyzer::{self, AnalysisOutcome},
    cache::LocalCache,
    coordinator::{FailureCoordinator, FailurePolicy},
    env::{CacheMode, RuntimeSettings},
    executor::{ExecutionStatus, Executor},
    fs,
    logger::ConsoleLogger,
    manifest::PackageReader,
    pool::WorkerPool,
    script::ScriptReference,
};

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code.
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "wireit",
    about = "Incremental, dependency-aware script runner",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a script and everything it depends on, skipping fresh work
    Run {
        /// Name of the script in the nearest package.json
        script: String,

        /// Worker pool size (overrides WIREIT_PARALLEL)
        #[arg(long)]
        parallel: Option<usize>,

        /// Failure policy (overrides WIREIT_FAILURES)
        #[arg(long)]
        failures: Option<FailurePolicy>,

        /// Trailing arguments appended to the root script's command
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Validate a script's graph and report every problem without
    /// running anything
    Analyze {
        /// Name of the script in the nearest package.json
        script: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let flags = TopLevelFlags::parse();
    log::make_logger(std::io::stderr, flags.color).init();

    match flags.command {
        Command::Run {
            script,
            parallel,
            failures,
            args,
        } => run(script, parallel, failures, args).await,
        Command::Analyze { script } => analyze_only(script).await,
    }
}

async fn run(
    script: String,
    parallel: Option<usize>,
    failures: Option<FailurePolicy>,
    args: Vec<String>,
) -> Result<ExitCode> {
    let mut settings = RuntimeSettings::from_env()?;
    if let Some(parallel) = parallel {
        settings.parallelism = parallel.max(1);
    }
    if let Some(policy) = failures {
        settings.failure_policy = policy;
    }

    let package_dir = find_package_dir().await?;
    let root = ScriptReference::new(package_dir, script);
    let reader = Arc::new(PackageReader::new());

    let config = match analyzer::analyze(reader, &root, &args).await? {
        AnalysisOutcome::Valid { config, warnings } => {
            for warning in &warnings {
                eprintln!("{warning}");
            }
            config
        }
        AnalysisOutcome::Invalid(problems) => {
            for problem in &problems {
                eprintln!("{problem}");
            }
            return Ok(ExitCode::from(1));
        }
    };

    let cache = match settings.cache {
        CacheMode::Local => Some(LocalCache::new()),
        CacheMode::None => None,
        CacheMode::Github => {
            warn!("the github cache backend is not available in this build; caching is disabled");
            None
        }
    };

    let pool = WorkerPool::new(settings.parallelism);
    let coordinator = FailureCoordinator::new(settings.failure_policy);
    let executor = Executor::new(
        pool.clone(),
        coordinator.clone(),
        cache,
        Arc::new(ConsoleLogger),
    );

    // SIGINT: stop admitting work, broadcast to children, and let
    // in-flight scripts unwind without writing fingerprints.
    tokio::spawn({
        let coordinator = coordinator.clone();
        let pool = pool.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coordinator.interrupt();
                pool.abort();
            }
        }
    });

    let result = executor.execute(&config).await;
    for failure in executor.failures() {
        eprintln!("{failure}");
    }

    if coordinator.interrupted() {
        // Conventional exit status for SIGINT termination.
        return Ok(ExitCode::from(130));
    }
    Ok(match result.status {
        ExecutionStatus::Success { .. } | ExecutionStatus::NoOp { .. } => ExitCode::SUCCESS,
        ExecutionStatus::Failed { .. } | ExecutionStatus::Skipped { .. } => ExitCode::from(1),
    })
}

async fn analyze_only(script: String) -> Result<ExitCode> {
    let package_dir = find_package_dir().await?;
    let root = ScriptReference::new(package_dir, script);
    let reader = Arc::new(PackageReader::new());

    match analyzer::analyze(reader, &root, &[]).await? {
        AnalysisOutcome::Valid { config, warnings } => {
            for warning in &warnings {
                eprintln!("{warning}");
            }
            let mut count = 0usize;
            let mut seen = std::collections::HashSet::new();
            let mut stack = vec![config];
            while let Some(node) = stack.pop() {
                if !seen.insert(node.key()) {
                    continue;
                }
                count += 1;
                stack.extend(node.dependencies.iter().map(|dep| dep.config.clone()));
            }
            println!("ok: {count} script(s) analyzed");
            Ok(ExitCode::SUCCESS)
        }
        AnalysisOutcome::Invalid(problems) => {
            for problem in &problems {
                eprintln!("{problem}");
            }
            Ok(ExitCode::from(1))
        }
    }
}

/// The package this invocation belongs to: the nearest ancestor of the
/// working directory containing a package.json.
async fn find_package_dir() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("get working directory")?;
    for dir in cwd.ancestors() {
        if fs::symlink_metadata(dir.join("package.json")).await?.is_some() {
            return Ok(dir.to_path_buf());
        }
    }
    bail!("no package.json was found in {} or any parent", cwd.display())
}
