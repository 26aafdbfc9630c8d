//! Process-wide failure policy.
//!
//! One coordinator exists per run. It latches the first failure, decides
//! whether new commands may start, and under the `kill` policy signals
//! the children that are already running.
//!
//! The admission check is deliberately made *after* a worker-pool permit
//! is acquired and *before* the command spawns: a permit released at the
//! same instant a sibling fails must not admit new work under `no-new`.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use derive_more::Display;
use tracing::{debug, warn};

/// How long a child gets to react to SIGINT before escalation.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum FailurePolicy {
    /// Stop scheduling new work on the first failure; running scripts
    /// finish. The default.
    #[display("no-new")]
    NoNew,
    /// Keep going; every script that can run, runs.
    #[display("continue")]
    Continue,
    /// Signal running children on the first failure.
    #[display("kill")]
    Kill,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::NoNew
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "no-new" => Ok(Self::NoNew),
            "continue" => Ok(Self::Continue),
            "kill" => Ok(Self::Kill),
            other => Err(format!(
                "expected \"no-new\", \"continue\", or \"kill\", got {other:?}",
            )),
        }
    }
}

/// Whether a script that just acquired a worker slot may spawn.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Admission {
    Run,
    /// Denied: a failure occurred under `no-new`/`kill`, or the process
    /// was interrupted.
    Abort,
}

#[derive(Clone, Debug)]
pub struct FailureCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    policy: FailurePolicy,
    failed: AtomicBool,
    interrupted: AtomicBool,
    /// Pids of running children, for `kill` and interrupt broadcast.
    children: Mutex<HashMap<u32, ()>>,
}

impl FailureCoordinator {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                failed: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.inner.policy
    }

    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Latch a script failure. Under `kill`, the first failure signals
    /// every running child.
    pub fn record_failure(&self) {
        let first = !self.inner.failed.swap(true, Ordering::SeqCst);
        if first && self.inner.policy == FailurePolicy::Kill {
            debug!("first failure under kill policy; signaling children");
            self.signal_children();
        }
    }

    /// Broadcast an interrupt: stop admitting new work and SIGINT every
    /// running child.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.signal_children();
    }

    pub fn interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Checked after permit acquisition, before spawn.
    pub fn admit(&self) -> Admission {
        if self.interrupted() {
            return Admission::Abort;
        }
        match self.inner.policy {
            FailurePolicy::Continue => Admission::Run,
            FailurePolicy::NoNew | FailurePolicy::Kill => {
                if self.failed() {
                    Admission::Abort
                } else {
                    Admission::Run
                }
            }
        }
    }

    /// Track a running child for signal delivery. Deregistered on drop.
    pub fn register_child(&self, pid: u32) -> ChildRegistration {
        lock_children(&self.inner).insert(pid, ());
        ChildRegistration {
            inner: Arc::clone(&self.inner),
            pid,
        }
    }

    fn signal_children(&self) {
        let pids: Vec<u32> = lock_children(&self.inner).keys().copied().collect();
        for pid in pids {
            signal(pid, libc::SIGINT);
        }

        // Escalate to SIGTERM for anything still registered after the
        // grace period.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let pids: Vec<u32> = lock_children(&inner).keys().copied().collect();
            for pid in pids {
                warn!(pid, "child ignored SIGINT; escalating to SIGTERM");
                signal(pid, libc::SIGTERM);
            }
        });
    }
}

/// Guard keeping a child pid registered while it runs.
#[derive(Debug)]
pub struct ChildRegistration {
    inner: Arc<Inner>,
    pid: u32,
}

impl Drop for ChildRegistration {
    fn drop(&mut self) {
        lock_children(&self.inner).remove(&self.pid);
    }
}

fn lock_children(inner: &Inner) -> std::sync::MutexGuard<'_, HashMap<u32, ()>> {
    inner
        .children
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(unix)]
fn signal(pid: u32, signal: i32) {
    // Sending to a pid that already exited is fine; the registry can lag
    // reaping by a beat.
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn signal(_pid: u32, _signal: i32) {}
