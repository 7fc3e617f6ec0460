//! OS capabilities used by the engine.
//!
//! The process table and the rename/remove operations of the restore swap sit
//! behind traits so one implementation per OS is chosen once, at startup, and
//! tests can substitute their own.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

use crate::profiles::ProfileRoots;

/// A running process as seen in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Query and signal processes.
pub trait ProcessTable: Send + Sync {
    /// Snapshot of all processes currently running.
    fn list(&self) -> Vec<ProcessEntry>;

    /// Ask a process to exit (SIGTERM on Unix).
    fn request_stop(&self, pid: u32) -> io::Result<()>;

    /// Kill a process outright.
    fn force_kill(&self, pid: u32) -> io::Result<()>;
}

/// Moves and deletes used to finalize or roll back a transfer.
pub trait Filesystem: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Process table backed by `sysinfo`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        SystemProcessTable {
            system: Mutex::new(System::new()),
        }
    }

    fn with_process<T>(
        &self,
        pid: u32,
        f: impl FnOnce(&sysinfo::Process) -> io::Result<T>,
        gone: T,
    ) -> io::Result<T> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => f(process),
            None => Ok(gone),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn list(&self) -> Vec<ProcessEntry> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect()
    }

    fn request_stop(&self, pid: u32) -> io::Result<()> {
        self.with_process(
            pid,
            |process| match process.kill_with(Signal::Term) {
                Some(true) => Ok(()),
                Some(false) => Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("could not signal process {}", pid),
                )),
                // No graceful signal on this platform
                None => {
                    if process.kill() {
                        Ok(())
                    } else {
                        Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            format!("could not stop process {}", pid),
                        ))
                    }
                }
            },
            (),
        )
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        self.with_process(
            pid,
            |process| {
                if process.kill() {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("could not kill process {}", pid),
                    ))
                }
            },
            (),
        )
    }
}

/// `std::fs` passthrough.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFilesystem;

impl Filesystem for StdFilesystem {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// The capabilities a coordinator runs against.
pub struct Platform {
    pub processes: Box<dyn ProcessTable>,
    pub filesystem: Box<dyn Filesystem>,
    pub roots: ProfileRoots,
}

impl Platform {
    /// Capabilities of the machine we are running on.
    pub fn current() -> Self {
        Platform {
            processes: Box::new(SystemProcessTable::new()),
            filesystem: Box::new(StdFilesystem),
            roots: ProfileRoots::detect(),
        }
    }

    pub fn new(
        processes: Box<dyn ProcessTable>,
        filesystem: Box<dyn Filesystem>,
        roots: ProfileRoots,
    ) -> Self {
        Platform {
            processes,
            filesystem,
            roots,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_table_lists_current_process() {
        let table = SystemProcessTable::new();
        let me = std::process::id();
        assert!(table.list().iter().any(|p| p.pid == me));
    }

    #[test]
    fn test_std_filesystem_rename() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let from = temp_dir.path().join("a");
        let to = temp_dir.path().join("b");
        fs::create_dir(&from).expect("Failed to create dir");

        StdFilesystem.rename(&from, &to).expect("Failed to rename");
        assert!(!from.exists());
        assert!(to.is_dir());

        StdFilesystem.remove_dir_all(&to).expect("Failed to remove");
        assert!(!to.exists());
    }
}
