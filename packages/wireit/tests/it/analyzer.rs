use pretty_assertions::assert_eq;
use serde_json::json;

use wireit::diagnostic::{Failure, FailureKind, Severity};

use crate::{TestWorkspace, analyze_invalid, analyze_valid};

fn kinds(failures: &[Failure]) -> Vec<FailureKind> {
    failures.iter().map(|failure| failure.kind).collect()
}

#[test_log::test(tokio::test)]
async fn same_package_dependencies_resolve_in_canonical_order() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"main": "wireit", "zeta": "wireit", "alpha": "wireit"},
                "wireit": {
                    "main": {"dependencies": ["zeta", "alpha"]},
                    "zeta": {"command": "true"},
                    "alpha": {"command": "true"},
                },
            }),
        )
        .await;

    let config = analyze_valid(&workspace.script("", "main")).await;
    let names: Vec<&str> = config
        .dependencies
        .iter()
        .map(|dep| dep.config.reference.name.as_str())
        .collect();
    // Declared [zeta, alpha]; sorted canonically by (packageDir, name).
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[test_log::test(tokio::test)]
async fn diamond_shares_one_node() {
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
                    "d": {"command": "true"},
                },
            }),
        )
        .await;

    let config = analyze_valid(&workspace.script("", "a")).await;
    let through_b = &config.dependencies[0].config.dependencies[0].config;
    let through_c = &config.dependencies[1].config.dependencies[0].config;
    assert!(std::sync::Arc::ptr_eq(through_b, through_c));
}

#[test_log::test(tokio::test)]
async fn missing_dependency_script_reports_the_edge_not_the_target() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {"dependencies": ["nope"]}},
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("", "a")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::DependencyOnMissingScript]);
    // The edge failure points at the specifier in the manifest.
    let location = failures[0].location.as_ref().unwrap();
    assert!(location.file.ends_with("package.json"));
    assert!(location.span.end > location.span.start);
}

#[test_log::test(tokio::test)]
async fn missing_cross_package_manifest_reports_the_edge_not_the_file() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "foo",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {"dependencies": ["../ghost#b"]}},
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("foo", "a")).await;
    assert_eq!(
        kinds(&failures),
        vec![FailureKind::DependencyOnMissingPackageJson],
    );
}

#[test_log::test(tokio::test)]
async fn root_missing_manifest_is_reported_plainly() {
    let workspace = TestWorkspace::new();
    tokio::fs::create_dir_all(workspace.package("empty"))
        .await
        .unwrap();

    let failures = analyze_invalid(&workspace.script("empty", "a")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::MissingPackageJson]);
}

#[test_log::test(tokio::test)]
async fn sentinel_without_config_is_a_syntax_error() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest("", json!({"scripts": {"a": "wireit"}}))
        .await;

    let failures = analyze_invalid(&workspace.script("", "a")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::InvalidConfigSyntax]);
}

#[test_log::test(tokio::test)]
async fn ignored_wireit_config_is_a_warning_only() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "echo plain"},
                "wireit": {"a": {"command": "echo configured"}},
            }),
        )
        .await;

    let root = workspace.script("", "a");
    let outcome = wireit::analyzer::analyze(
        std::sync::Arc::new(wireit::manifest::PackageReader::new()),
        &root,
        &[],
    )
    .await
    .unwrap();
    match outcome {
        wireit::analyzer::AnalysisOutcome::Valid { config, warnings } => {
            // The plain script wins; the wireit config is inert.
            assert_eq!(config.command.as_deref(), Some("echo plain"));
            assert_eq!(kinds(&warnings), vec![FailureKind::ScriptNotWireit]);
            assert_eq!(warnings[0].severity, Severity::Warning);
        }
        other => panic!("expected valid outcome, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn duplicate_dependencies_report_both_occurrences() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit", "b": "wireit"},
                "wireit": {
                    "a": {"dependencies": ["b", {"script": "b"}]},
                    "b": {"command": "true"},
                },
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("", "a")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::DuplicateDependency]);
    assert_eq!(failures[0].supplemental.len(), 1);
    assert!(failures[0].supplemental[0].location.is_some());
}

#[test_log::test(tokio::test)]
async fn config_problems_are_all_reported_in_one_pass() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {
                    "command": "",
                    "output": ["dist/**"],
                    "files": ["src/**", ""],
                    "clean": "sometimes",
                }},
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("", "a")).await;
    // Empty command, empty files entry, bad clean value. Every problem
    // in one run, not just the first.
    assert_eq!(failures.len(), 3);
    assert!(failures.iter().all(|f| f.kind == FailureKind::InvalidConfigSyntax));
}

#[test_log::test(tokio::test)]
async fn service_constraints_are_enforced() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"serve": "wireit"},
                "wireit": {"serve": {
                    "command": "node server.js",
                    "service": true,
                    "output": ["logs/**"],
                }},
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("", "serve")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::InvalidConfigSyntax]);
}

#[test_log::test(tokio::test)]
async fn cycle_trail_is_deterministic_and_complete() {
    let workspace = TestWorkspace::new();
    // Declaration order deliberately scrambled; the trail must not care.
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"c": "wireit", "a": "wireit", "b": "wireit"},
                "wireit": {
                    "c": {"dependencies": ["a"]},
                    "a": {"dependencies": ["b"]},
                    "b": {"dependencies": ["c"]},
                },
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("", "a")).await;
    let cycle = failures
        .iter()
        .find(|failure| failure.kind == FailureKind::Cycle)
        .expect("cycle failure");
    let messages: Vec<&str> = cycle
        .supplemental
        .iter()
        .map(|annotation| annotation.message.as_str())
        .collect();
    assert_eq!(
        messages,
        vec![
            "\"a\" points to \"b\"",
            "\"b\" points to \"c\"",
            "\"c\" points back to \"a\"",
        ],
    );
    // Every edge carries the location of its declaration.
    assert!(cycle.supplemental.iter().all(|a| a.location.is_some()));
}

#[test_log::test(tokio::test)]
async fn cycle_trail_rotates_with_the_root() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "",
            json!({
                "scripts": {"a": "wireit", "b": "wireit", "c": "wireit"},
                "wireit": {
                    "a": {"dependencies": ["b"]},
                    "b": {"dependencies": ["c"]},
                    "c": {"dependencies": ["a"]},
                },
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("", "b")).await;
    let cycle = failures
        .iter()
        .find(|failure| failure.kind == FailureKind::Cycle)
        .expect("cycle failure");
    let messages: Vec<&str> = cycle
        .supplemental
        .iter()
        .map(|annotation| annotation.message.as_str())
        .collect();
    assert_eq!(
        messages,
        vec![
            "\"b\" points to \"c\"",
            "\"c\" points to \"a\"",
            "\"a\" points back to \"b\"",
        ],
    );
}

#[test_log::test(tokio::test)]
async fn historical_colon_separator_still_parses() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "foo",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {"dependencies": ["../bar:b"]}},
            }),
        )
        .await;
    workspace
        .manifest(
            "bar",
            json!({
                "scripts": {"b": "wireit"},
                "wireit": {"b": {"command": "true"}},
            }),
        )
        .await;

    let config = analyze_valid(&workspace.script("foo", "a")).await;
    assert_eq!(config.dependencies.len(), 1);
    assert_eq!(
        config.dependencies[0].config.reference,
        workspace.script("bar", "b"),
    );
}

#[test_log::test(tokio::test)]
async fn cross_package_self_reference_is_rejected() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "foo",
            json!({
                "scripts": {"a": "wireit", "b": "wireit"},
                "wireit": {
                    "a": {"dependencies": ["../foo#b"]},
                    "b": {"command": "true"},
                },
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("foo", "a")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::InvalidConfigSyntax]);
}

#[test_log::test(tokio::test)]
async fn dependencies_expansion_finds_installed_packages() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "app",
            json!({
                "scripts": {"test": "wireit"},
                "wireit": {"test": {"dependencies": ["<dependencies>#test"]}},
                "dependencies": {"lib-a": "^1.0.0", "lib-b": "^1.0.0"},
                "devDependencies": {"tool": "^2.0.0"},
            }),
        )
        .await;
    // lib-a and tool have a test script; lib-b does not.
    workspace
        .manifest("app/node_modules/lib-a", json!({"scripts": {"test": "true"}}))
        .await;
    workspace
        .manifest("app/node_modules/lib-b", json!({"scripts": {"build": "true"}}))
        .await;
    workspace
        .manifest("node_modules/tool", json!({"scripts": {"test": "true"}}))
        .await;

    let config = analyze_valid(&workspace.script("app", "test")).await;
    let mut targets: Vec<String> = config
        .dependencies
        .iter()
        .map(|dep| dep.config.reference.package_dir.display().to_string())
        .collect();
    targets.sort();
    assert_eq!(targets.len(), 2);
    assert!(targets[0].ends_with("app/node_modules/lib-a"));
    assert!(targets[1].ends_with("node_modules/tool"));
}

#[test_log::test(tokio::test)]
async fn dependencies_expansion_to_nothing_is_a_failure() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "app",
            json!({
                "scripts": {"test": "wireit"},
                "wireit": {"test": {"dependencies": ["<dependencies>#test"]}},
                "dependencies": {"lib-a": "^1.0.0"},
            }),
        )
        .await;

    let failures = analyze_invalid(&workspace.script("app", "test")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::InvalidConfigSyntax]);
}

#[test_log::test(tokio::test)]
async fn package_locks_amend_input_files_at_every_ancestor_depth() {
    let workspace = TestWorkspace::new();
    workspace
        .manifest(
            "pkg",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {"command": "true", "files": ["in.txt"]}},
            }),
        )
        .await;

    let config = analyze_valid(&workspace.script("pkg", "a")).await;
    let files = config.files.as_ref().unwrap();
    assert!(files.contains(&String::from("in.txt")));
    assert!(files.contains(&String::from("package-lock.json")));
    assert!(files.contains(&String::from("../package-lock.json")));

    // An explicit empty packageLocks array disables the amendment.
    workspace
        .manifest(
            "plain",
            json!({
                "scripts": {"a": "wireit"},
                "wireit": {"a": {"command": "true", "files": ["in.txt"], "packageLocks": []}},
            }),
        )
        .await;
    let config = analyze_valid(&workspace.script("plain", "a")).await;
    assert_eq!(config.files.as_ref().unwrap(), &vec![String::from("in.txt")]);
}

#[test_log::test(tokio::test)]
async fn invalid_json_reports_once_for_the_whole_file() {
    let workspace = TestWorkspace::new();
    workspace.file("broken/package.json", "{ not json").await;

    let failures = analyze_invalid(&workspace.script("broken", "a")).await;
    assert_eq!(kinds(&failures), vec![FailureKind::InvalidPackageJson]);
}
