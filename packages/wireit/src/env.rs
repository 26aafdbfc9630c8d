//! Runtime settings read from the environment.
//!
//! Everything the run itself is parameterized by comes in through
//! environment variables so that wireit behaves identically however it
//! was invoked: `WIREIT_PARALLEL` bounds the worker pool,
//! `WIREIT_FAILURES` picks the failure policy, and `WIREIT_CACHE` picks
//! the cache backend (defaulting to local, or to none on CI).

use std::str::FromStr;

use color_eyre::{Result, eyre::bail};

use crate::coordinator::FailurePolicy;

pub const PARALLEL_VAR: &str = "WIREIT_PARALLEL";
pub const FAILURES_VAR: &str = "WIREIT_FAILURES";
pub const CACHE_VAR: &str = "WIREIT_CACHE";

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CacheMode {
    None,
    Local,
    /// The remote GitHub Actions backend. Not shipped here; selecting it
    /// runs with caching disabled after a warning.
    Github,
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "local" => Ok(Self::Local),
            "github" => Ok(Self::Github),
            other => Err(format!(
                "expected \"none\", \"local\", or \"github\", got {other:?}",
            )),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RuntimeSettings {
    pub parallelism: usize,
    pub failure_policy: FailurePolicy,
    pub cache: CacheMode,
}

impl RuntimeSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let parallelism = match std::env::var(PARALLEL_VAR) {
            Ok(value) => match value.parse::<usize>() {
                Ok(parallelism) if parallelism >= 1 => parallelism,
                _ => bail!("{PARALLEL_VAR} must be an integer >= 1, got {value:?}"),
            },
            Err(_) => num_cpus::get(),
        };

        let failure_policy = match std::env::var(FAILURES_VAR) {
            Ok(value) => match value.parse() {
                Ok(policy) => policy,
                Err(message) => bail!("invalid {FAILURES_VAR}: {message}"),
            },
            Err(_) => FailurePolicy::default(),
        };

        let cache = match std::env::var(CACHE_VAR) {
            Ok(value) => match value.parse() {
                Ok(cache) => cache,
                Err(message) => bail!("invalid {CACHE_VAR}: {message}"),
            },
            // Local caching rarely helps on CI (fresh machines) and can
            // only cost disk, so an unset variable there means none.
            Err(_) if is_ci() => CacheMode::None,
            Err(_) => CacheMode::Local,
        };

        Ok(Self {
            parallelism,
            failure_policy,
            cache,
        })
    }
}

/// CI detection: the generic `CI` variable that most providers set, plus
/// the providers that spell it differently.
pub fn is_ci() -> bool {
    const TRUTHY: &[&str] = &["CI", "GITHUB_ACTIONS", "GITLAB_CI", "CIRCLECI", "TRAVIS"];
    const PRESENT: &[&str] = &["JENKINS_URL", "TEAMCITY_VERSION", "BUILD_BUILDURI"];

    TRUTHY
        .iter()
        .any(|var| std::env::var(var).is_ok_and(|v| v == "true" || v == "1"))
        || PRESENT.iter().any(|var| std::env::var(var).is_ok())
}
