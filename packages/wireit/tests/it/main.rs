//! Integration tests for the analyzer/executor pipeline.
//!
//! Each test builds a throwaway package tree in a tempdir, writes real
//! `package.json` manifests, and drives the library the way the CLI
//! does. Commands are tiny shell one-liners, so these tests exercise the
//! genuine spawn/capture/fingerprint path.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::TempDir;

use wireit::{
    analyzer::AnalysisOutcome,
    cache::LocalCache,
    coordinator::{FailureCoordinator, FailurePolicy},
    diagnostic::Failure,
    executor::{ExecutionResult, Executor},
    logger::QuietLogger,
    manifest::PackageReader,
    pool::WorkerPool,
    script::{ScriptConfig, ScriptReference},
};

pub mod analyzer;
pub mod executor;

/// A throwaway multi-package tree.
pub struct TestWorkspace {
    // Held for cleanup on drop.
    _temp: TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    #[track_caller]
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temporary directory");
        // Canonicalize so references compare equal with paths the
        // analyzer derives itself (tempdirs often live behind symlinks).
        let root = temp
            .path()
            .canonicalize()
            .expect("canonicalize temporary directory");
        Self { _temp: temp, root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn package(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    pub fn script(&self, rel: &str, name: &str) -> ScriptReference {
        ScriptReference::new(self.package(rel), name)
    }

    pub async fn manifest(&self, rel: &str, contents: serde_json::Value) {
        let dir = self.package(rel);
        tokio::fs::create_dir_all(&dir).await.expect("create package dir");
        tokio::fs::write(
            dir.join("package.json"),
            serde_json::to_string_pretty(&contents).expect("encode manifest"),
        )
        .await
        .expect("write manifest");
    }

    pub async fn file(&self, rel: &str, contents: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.expect("create parent dir");
        }
        tokio::fs::write(&path, contents).await.expect("write file");
    }

    pub async fn read(&self, rel: &str) -> Option<String> {
        tokio::fs::read_to_string(self.root.join(rel)).await.ok()
    }

    /// Count of non-empty lines, for marker files commands append to.
    pub async fn line_count(&self, rel: &str) -> usize {
        self.read(rel)
            .await
            .map(|content| content.lines().filter(|line| !line.is_empty()).count())
            .unwrap_or(0)
    }
}

pub async fn analyze_valid(root: &ScriptReference) -> Arc<ScriptConfig> {
    match wireit::analyzer::analyze(Arc::new(PackageReader::new()), root, &[])
        .await
        .expect("analysis infrastructure")
    {
        AnalysisOutcome::Valid { config, .. } => config,
        AnalysisOutcome::Invalid(failures) => panic!("expected valid graph, got {failures:#?}"),
    }
}

pub async fn analyze_invalid(root: &ScriptReference) -> Vec<Failure> {
    match wireit::analyzer::analyze(Arc::new(PackageReader::new()), root, &[])
        .await
        .expect("analysis infrastructure")
    {
        AnalysisOutcome::Valid { config, .. } => {
            panic!("expected failures, got valid graph for {}", config.reference)
        }
        AnalysisOutcome::Invalid(failures) => failures,
    }
}

pub struct TestRun {
    pub executor: Executor<LocalCache>,
    pub coordinator: FailureCoordinator,
}

impl TestRun {
    pub fn new(cache: bool, policy: FailurePolicy, parallelism: usize) -> Self {
        let coordinator = FailureCoordinator::new(policy);
        Self {
            executor: Executor::new(
                WorkerPool::new(parallelism),
                coordinator.clone(),
                cache.then(LocalCache::new),
                Arc::new(QuietLogger),
            ),
            coordinator,
        }
    }

    pub async fn execute(&self, config: &Arc<ScriptConfig>) -> ExecutionResult {
        self.executor.execute(config).await
    }
}

/// Analyze and execute in one go, the way `wireit run` does, with a
/// fresh executor (so freshness comes from on-disk state, not run-level
/// memoization).
pub async fn run_once(root: &ScriptReference, cache: bool) -> (ExecutionResult, Vec<Failure>) {
    let config = analyze_valid(root).await;
    let run = TestRun::new(cache, FailurePolicy::NoNew, 4);
    let result = run.execute(&config).await;
    (result, run.executor.failures())
}
