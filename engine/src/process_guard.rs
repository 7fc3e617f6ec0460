//! Detect and stop a running Firefox or Thunderbird.
//!
//! A profile must not be copied while its application has it open. The guard
//! finds matching processes by executable name and can ask them to exit.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::model::ApplicationKind;
use crate::platform::{ProcessEntry, ProcessTable};

pub struct ProcessGuard<'a> {
    table: &'a dyn ProcessTable,
    poll_interval: Duration,
    force_kill: bool,
}

/// Normalize an executable name for comparison: lowercase, no `.exe`.
fn normalize(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

impl<'a> ProcessGuard<'a> {
    pub fn new(table: &'a dyn ProcessTable, poll_interval: Duration) -> Self {
        ProcessGuard {
            table,
            poll_interval,
            force_kill: false,
        }
    }

    /// Kill processes that survive the graceful wait instead of giving up.
    pub fn with_force_kill(mut self, enabled: bool) -> Self {
        self.force_kill = enabled;
        self
    }

    /// Processes currently running as `kind`.
    pub fn matching(&self, kind: ApplicationKind) -> Vec<ProcessEntry> {
        let names = kind.process_names();
        self.table
            .list()
            .into_iter()
            .filter(|p| names.contains(&normalize(&p.name).as_str()))
            .collect()
    }

    pub fn is_running(&self, kind: ApplicationKind) -> bool {
        !self.matching(kind).is_empty()
    }

    /// Ask every instance of `kind` to exit and wait up to `timeout` for them to go.
    ///
    /// This may close a window the user is working in; callers must have the
    /// user's consent before calling it.
    pub fn terminate(&self, kind: ApplicationKind, timeout: Duration) -> Result<(), ProcessError> {
        let running = self.matching(kind);
        if running.is_empty() {
            return Ok(());
        }

        info!(%kind, count = running.len(), "asking application to exit");
        for process in &running {
            if let Err(e) = self.table.request_stop(process.pid) {
                warn!(%kind, pid = process.pid, error = %e, "stop request not delivered");
            }
        }

        if self.wait_for_exit(kind, timeout) {
            return Ok(());
        }

        if self.force_kill {
            for process in self.matching(kind) {
                warn!(%kind, pid = process.pid, "process ignored stop request, killing");
                if let Err(e) = self.table.force_kill(process.pid) {
                    warn!(%kind, pid = process.pid, error = %e, "kill failed");
                }
            }
            if self.wait_for_exit(kind, self.poll_interval) {
                return Ok(());
            }
        }

        Err(ProcessError::StillRunning { kind })
    }

    /// Poll until no `kind` process is left. Always checks at least once.
    fn wait_for_exit(&self, kind: ApplicationKind, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running(kind) {
                debug!(%kind, "application exited");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
