use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::json;

use wireit::{
    coordinator::FailurePolicy,
    diagnostic::FailureKind,
    executor::{ExecutionStatus, Executor, SkipReason},
    logger::{Logger, OutputStream},
    manifest::PackageReader,
    pool::WorkerPool,
    script::ScriptReference,
    state::StateDir,
};

use crate::{TestRun, TestWorkspace, analyze_valid, run_once};

fn assert_success(status: &ExecutionStatus, fresh: bool, from_cache: bool) {
    match status {
        ExecutionStatus::Success {
            fresh: got_fresh,
            from_cache: got_cache,
            ..
        } => {
            assert_eq!((*got_fresh, *got_cache), (fresh, from_cache));
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn fresh_scripts_skip_their_command() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "echo ran >> runs.txt",
                    "files": ["in.txt"],
                    "output": [],
                }},
            }),
        )
        .await;
    workspace.file("in.txt", "v0").await;
    let root = workspace.script("", "a");

    let (result, _) = run_once(&root, false).await;
    assert_success(&result.status, false, false);
    assert_eq!(workspace.line_count("runs.txt").await, 1);

    // Unchanged inputs: the command must not run again.
    let (result, _) = run_once(&root, false).await;
    assert_success(&result.status, true, false);
    assert_eq!(workspace.line_count("runs.txt").await, 1);

    // Same content, new mtime: still fresh. Content hashing, not mtimes.
    workspace.file("in.txt", "v0").await;
    let (result, _) = run_once(&root, false).await;
    assert_success(&result.status, true, false);
    assert_eq!(workspace.line_count("runs.txt").await, 1);

    // Changed content: runs.
    workspace.file("in.txt", "v1").await;
    let (result, _) = run_once(&root, false).await;
    assert_success(&result.status, false, false);
    assert_eq!(workspace.line_count("runs.txt").await, 2);
}

#[test_log::test(tokio::test)]
async fn cache_round_trip_restores_previous_outputs() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "cp in out && echo ran >> runs.txt",
                    "files": ["in"],
                    "output": ["out"],
                }},
            }),
        )
        .await;
    let root = workspace.script("", "a");

    workspace.file("in", "v0").await;
    let (result, _) = run_once(&root, true).await;
    assert_success(&result.status, false, false);
    assert_eq!(workspace.read("out").await.as_deref(), Some("v0"));

    workspace.file("in", "v1").await;
    run_once(&root, true).await;
    assert_eq!(workspace.read("out").await.as_deref(), Some("v1"));
    assert_eq!(workspace.line_count("runs.txt").await, 2);

    // Reverting the input must restore the old output from cache
    // without running the command.
    workspace.file("in", "v0").await;
    let (result, _) = run_once(&root, true).await;
    assert_success(&result.status, false, true);
    assert_eq!(workspace.read("out").await.as_deref(), Some("v0"));
    assert_eq!(workspace.line_count("runs.txt").await, 2);

    workspace.file("in", "v1").await;
    let (result, _) = run_once(&root, true).await;
    assert_success(&result.status, false, true);
    assert_eq!(workspace.read("out").await.as_deref(), Some("v1"));
    assert_eq!(workspace.line_count("runs.txt").await, 2);
}

#[test_log::test(tokio::test)]
async fn failure_propagates_to_dependents_but_not_started_siblings() {
    let workspace = TestWorkspace::new();
    // b and d handshake through marker files: d waits for b to start
    // before failing, and b waits for d's failure before finishing, so
    // the interesting interleaving is guaranteed rather than likely.
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit", "b": "wireit", "c": "wireit", "d": "wireit"},
                "wireit": {
                    "a": {"dependencies": ["b", "c"]},
                    "b": {"command": "touch b-started; while [ ! -f d-failed ]; do sleep 0.01; done; echo ok >> b-ran.txt"},
                    "c": {"dependencies": ["d"]},
                    "d": {"command": "while [ ! -f b-started ]; do sleep 0.01; done; touch d-failed; exit 1"},
                },
            }),
        )
        .await;
    let root = workspace.script("", "a");

    let config = analyze_valid(&root).await;
    let run = TestRun::new(false, FailurePolicy::NoNew, 4);
    let result = run.execute(&config).await;

    assert!(matches!(
        result.status,
        ExecutionStatus::Failed {
            kind: FailureKind::DependencyFailed,
        },
    ));

    // b had already started when d failed, so it ran to completion.
    assert_eq!(workspace.line_count("b-ran.txt").await, 1);

    let mut kinds: Vec<FailureKind> = run
        .executor
        .failures()
        .iter()
        .map(|failure| failure.kind)
        .collect();
    kinds.sort();
    assert_eq!(
        kinds,
        vec![
            FailureKind::ExitNonZero,
            FailureKind::DependencyFailed,
            FailureKind::DependencyFailed,
        ],
    );
}

#[test_log::test(tokio::test)]
async fn cross_package_dependency_runs_first_and_reads_each_manifest_once() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "foo",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "echo a >> ../order.txt",
                    "dependencies": ["../bar#b"],
                }},
            }),
        )
        .await;
    workspace
        .manifest(
            "bar",
            json!({
                "scripts": {"b": "wireit"},
                "wireit": {"b": {"command": "echo b >> ../order.txt"}},
            }),
        )
        .await;
    let root = workspace.script("foo", "a");

    let reader = Arc::new(PackageReader::new());
    let outcome = wireit::analyzer::analyze(Arc::clone(&reader), &root, &[])
        .await
        .unwrap();
    let wireit::analyzer::AnalysisOutcome::Valid { config, .. } = outcome else {
        panic!("expected valid graph");
    };
    assert_eq!(reader.loaded_count(), 2);

    let run = TestRun::new(false, FailurePolicy::NoNew, 4);
    let result = run.execute(&config).await;
    assert!(result.status.is_success());
    assert_eq!(workspace.read("order.txt").await.as_deref(), Some("b\na\n"));
    assert_eq!(reader.loaded_count(), 2);
}

#[test_log::test(tokio::test)]
async fn env_projection_feeds_the_fingerprint_and_the_child() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "printf '%s' \"$WIREIT_IT_FOO\" > out-foo && echo ran >> runs.txt",
                    "files": ["in.txt"],
                    "env": {
                        "WIREIT_IT_FOO": "x",
                        "WIREIT_IT_BAR": {"external": true},
                    },
                }},
            }),
        )
        .await;
    workspace.file("in.txt", "v0").await;
    let root = workspace.script("", "a");

    // The literal wins over whatever the parent environment carries.
    unsafe {
        std::env::set_var("WIREIT_IT_FOO", "inherited");
        std::env::set_var("WIREIT_IT_BAR", "1");
    }
    run_once(&root, false).await;
    assert_eq!(workspace.read("out-foo").await.as_deref(), Some("x"));
    assert_eq!(workspace.line_count("runs.txt").await, 1);
    let first = StateDir::new(&root)
        .read_fingerprint()
        .await
        .unwrap()
        .expect("fingerprint written");

    // Unsetting the external variable changes the fingerprint, so the
    // script re-runs.
    unsafe {
        std::env::remove_var("WIREIT_IT_BAR");
    }
    run_once(&root, false).await;
    assert_eq!(workspace.line_count("runs.txt").await, 2);
    let second = StateDir::new(&root)
        .read_fingerprint()
        .await
        .unwrap()
        .expect("fingerprint written");
    assert_ne!(first.canonical(), second.canonical());

    unsafe {
        std::env::remove_var("WIREIT_IT_FOO");
    }
}

#[test_log::test(tokio::test)]
async fn diamond_runs_the_shared_tail_once() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit", "b": "wireit", "c": "wireit", "d": "wireit"},
                "wireit": {
                    "a": {"dependencies": ["b", "c"]},
                    "b": {"dependencies": ["d"]},
                    "c": {"dependencies": ["d"]},
                    "d": {"command": "echo d >> d-runs.txt"},
                },
            }),
        )
        .await;
    let root = workspace.script("", "a");

    let (result, _) = run_once(&root, false).await;
    assert!(result.status.is_success());
    assert_eq!(workspace.line_count("d-runs.txt").await, 1);
}

#[test_log::test(tokio::test)]
async fn extra_args_reach_the_root_command_only() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit", "b": "wireit"},
                "wireit": {
                    "a": {"command": "echo", "dependencies": ["b"]},
                    "b": {"command": "echo b-output"},
                },
            }),
        )
        .await;
    let root = workspace.script("", "a");

    let reader = Arc::new(PackageReader::new());
    let outcome =
        wireit::analyzer::analyze(reader, &root, &[String::from("hello-from-args")])
            .await
            .unwrap();
    let wireit::analyzer::AnalysisOutcome::Valid { config, .. } = outcome else {
        panic!("expected valid graph");
    };
    assert_eq!(config.extra_args, vec!["hello-from-args"]);
    // Extra args apply to the root only.
    assert!(config.dependencies[0].config.extra_args.is_empty());

    let run = TestRun::new(false, FailurePolicy::NoNew, 4);
    run.execute(&config).await;
    let captured = tokio::fs::read_to_string(
        StateDir::new(&root).capture_path(OutputStream::Stdout),
    )
    .await
    .unwrap();
    assert!(captured.contains("hello-from-args"));
}

#[test_log::test(tokio::test)]
async fn output_escaping_the_package_is_fatal() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "pkg",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "true",
                    "files": ["in.txt"],
                    "output": ["../escape.txt"],
                }},
            }),
        )
        .await;
    workspace.file("pkg/in.txt", "v0").await;
    workspace.file("escape.txt", "precious").await;
    let root = workspace.script("pkg", "a");

    let (result, failures) = run_once(&root, false).await;
    assert!(matches!(
        result.status,
        ExecutionStatus::Failed {
            kind: FailureKind::OutputOutsidePackage,
        },
    ));
    assert_eq!(failures.len(), 1);
    // Cleaning never removed the file outside the package.
    assert_eq!(workspace.read("escape.txt").await.as_deref(), Some("precious"));
}

#[test_log::test(tokio::test)]
async fn clean_false_preserves_stale_outputs() {
    let workspace = TestWorkspace::new();
    for (package, clean) in [("always", json!(true)), ("never", json!(false))] {
        workspace
            .manifest(
                package,
                json!({
                    "scripts": {"a": "wireit"},
                    "wireit": {"a": {
                        "command": "mkdir -p out && touch out/$(cat in.txt)",
                        "files": ["in.txt"],
                        "output": ["out/**"],
                        "clean": clean,
                    }},
                }),
            )
            .await;
    }

    for package in ["always", "never"] {
        workspace.file(&format!("{package}/in.txt"), "one").await;
        run_once(&workspace.script(package, "a"), false).await;
        workspace.file(&format!("{package}/in.txt"), "two").await;
        run_once(&workspace.script(package, "a"), false).await;
    }

    // clean: true removed the stale artifact; clean: false kept it.
    assert!(workspace.read("always/out/one").await.is_none());
    assert!(workspace.read("never/out/one").await.is_some());
    assert!(workspace.read("always/out/two").await.is_some());
    assert!(workspace.read("never/out/two").await.is_some());
}

#[test_log::test(tokio::test)]
async fn clean_if_file_deleted_only_reacts_to_deletions() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "mkdir -p out && for f in src/*.txt; do cp \"$f\" out/; done",
                    "files": ["src/**"],
                    "output": ["out/**"],
                    "clean": "if-file-deleted",
                }},
            }),
        )
        .await;
    workspace.file("src/a.txt", "a0").await;
    workspace.file("src/b.txt", "b0").await;
    let root = workspace.script("", "a");
    run_once(&root, false).await;

    // A modification alone must not trigger cleaning.
    workspace.file("out/planted.txt", "survives").await;
    workspace.file("src/a.txt", "a1").await;
    run_once(&root, false).await;
    assert!(workspace.read("out/planted.txt").await.is_some());

    // A deleted input must.
    workspace.file("out/planted2.txt", "doomed").await;
    tokio::fs::remove_file(workspace.path().join("src/b.txt"))
        .await
        .unwrap();
    run_once(&root, false).await;
    assert!(workspace.read("out/planted2.txt").await.is_none());
    assert!(workspace.read("out/b.txt").await.is_none());
    assert!(workspace.read("out/a.txt").await.is_some());
}

/// Replays captured output verbatim when a script is fresh.
#[test_log::test(tokio::test)]
async fn fresh_scripts_replay_captured_output() {
    #[derive(Default)]
    struct Capture(Mutex<Vec<u8>>);
    impl Logger for Capture {
        fn output(&self, _: &ScriptReference, _: OutputStream, chunk: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(chunk);
        }
    }

    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "echo hello-replay",
                    "files": ["in.txt"],
                }},
            }),
        )
        .await;
    workspace.file("in.txt", "v0").await;
    let root = workspace.script("", "a");
    run_once(&root, false).await;

    let config = analyze_valid(&root).await;
    let logger = Arc::new(Capture::default());
    let executor = Executor::new(
        WorkerPool::new(2),
        wireit::coordinator::FailureCoordinator::new(FailurePolicy::NoNew),
        Option::<wireit::cache::LocalCache>::None,
        logger.clone(),
    );
    let result = executor.execute(&config).await;
    assert_success(&result.status, true, false);

    let replayed = String::from_utf8(logger.0.lock().unwrap().clone()).unwrap();
    assert_eq!(replayed, "hello-replay\n");
}

/// Invariant: once a failure latches under no-new, a script that had not
/// spawned is skipped, and a script observed to have run must have been
/// admitted before the latch.
#[test_log::test(tokio::test)]
async fn no_new_never_spawns_after_a_failure() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit", "boom": "wireit", "late": "wireit"},
                "wireit": {
                    "a": {"dependencies": ["boom", "late"]},
                    "boom": {"command": "exit 1"},
                    "late": {"command": "sleep 0.05 && echo late >> late.txt"},
                },
            }),
        )
        .await;
    let root = workspace.script("", "a");

    let config = analyze_valid(&root).await;
    let run = TestRun::new(false, FailurePolicy::NoNew, 1);
    let result = run.execute(&config).await;
    assert!(matches!(
        result.status,
        ExecutionStatus::Failed {
            kind: FailureKind::DependencyFailed,
        },
    ));

    // With one worker slot the launch order is random, so either script
    // may have won it; what is never legal is late spawning after the
    // latch. Its memoized result tells us which branch happened.
    let late = &config.dependencies[1].config;
    assert_eq!(late.reference.name, "late");
    let late_result = run.execute(late).await;
    let late_ran = workspace.line_count("late.txt").await == 1;
    match late_result.status {
        ExecutionStatus::Success { .. } => assert!(late_ran),
        ExecutionStatus::Skipped { .. } => assert!(!late_ran),
        other => panic!("unexpected status for late: {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn interrupt_skips_everything_not_started() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {"command": "echo ran >> runs.txt"}},
            }),
        )
        .await;
    let root = workspace.script("", "a");

    let config = analyze_valid(&root).await;
    let run = TestRun::new(false, FailurePolicy::NoNew, 1);
    run.coordinator.interrupt();
    let result = run.execute(&config).await;
    assert!(matches!(
        result.status,
        ExecutionStatus::Skipped {
            reason: SkipReason::Interrupted,
        },
    ));
    assert_eq!(workspace.line_count("runs.txt").await, 0);
}

#[test_log::test(tokio::test)]
async fn fingerprints_ignore_declaration_order() {
    let workspace = TestWorkspace::new();
    let manifest = |deps: [&str; 2], files: [&str; 2]| {
        json!({
            "scripts": {"a": "wireit", "x": "wireit", "y": "wireit"},
            "wireit": {
                "a": {
                    "command": "true",
                    "dependencies": deps,
                    "files": files,
                    "env": {"WIREIT_IT_ORDER_ONE": "1", "WIREIT_IT_ORDER_TWO": "2"},
                },
                "x": {"command": "true", "files": []},
                "y": {"command": "true", "files": []},
            },
        })
    };
    workspace.file("f1.txt", "one").await;
    workspace.file("f2.txt", "two").await;
    let root = workspace.script("", "a");

    workspace
        .manifest("", manifest(["x", "y"], ["f1.txt", "f2.txt"]))
        .await;
    run_once(&root, false).await;
    let first = StateDir::new(&root)
        .read_fingerprint()
        .await
        .unwrap()
        .expect("fingerprint written");

    // Same graph, permuted declarations: identical canonical bytes, so
    // the second run is fresh.
    workspace
        .manifest("", manifest(["y", "x"], ["f2.txt", "f1.txt"]))
        .await;
    let (result, _) = run_once(&root, false).await;
    assert_success(&result.status, true, false);
    let second = StateDir::new(&root)
        .read_fingerprint()
        .await
        .unwrap()
        .expect("fingerprint written");
    assert_eq!(first.canonical(), second.canonical());
}

#[test_log::test(tokio::test)]
async fn no_command_scripts_group_their_dependencies() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"all": "wireit", "one": "wireit"},
                "wireit": {
                    "all": {"dependencies": ["one"]},
                    "one": {"command": "echo one >> runs.txt"},
                },
            }),
        )
        .await;
    let root = workspace.script("", "all");

    let (result, _) = run_once(&root, false).await;
    assert!(matches!(result.status, ExecutionStatus::NoOp { .. }));
    assert_eq!(workspace.line_count("runs.txt").await, 1);
}
