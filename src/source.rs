//! Access to a procfs-shaped directory tree.
//!
//! The live system is `/proc`, but any directory laid out the same way works:
//! an unpacked dump, or a fixture tree in tests. Files are opened per call and
//! dropped when the caller is done, no handle outlives one extraction.

use std::path::{Path, PathBuf};

use log::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcRoot {
    root: PathBuf,
}

impl Default for ProcRoot {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcRoot {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of a global file, eg. `iomem` or `sysvipc/shm`
    pub fn global_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Path of a per-process file, eg. `<pid>/maps`
    pub fn process_path(&self, pid: i32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }

    pub fn read_global(&self, name: &str) -> Result<String> {
        let path = self.global_path(name);
        std::fs::read_to_string(&path).map_err(|e| Error::from_io(path, e))
    }

    pub fn read_process(&self, pid: i32, name: &str) -> Result<String> {
        let path = self.process_path(pid, name);
        std::fs::read_to_string(&path).map_err(|e| Error::from_process_io(pid, path, e))
    }

    /// Handle on `<root>/<pid>` for the readers of procfs
    pub fn process(&self, pid: i32) -> Result<procfs::process::Process> {
        procfs::process::Process::new_with_root(self.root.join(pid.to_string()))
            .map_err(|e| Error::from_proc(Some(pid), e))
    }

    /// `cmdline` split on NUL bytes. Kernel threads have an empty command line.
    pub fn cmdline(&self, pid: i32) -> Result<Vec<String>> {
        let path = self.process_path(pid, "cmdline");
        let raw = std::fs::read(&path).map_err(|e| Error::from_process_io(pid, path, e))?;

        Ok(raw
            .split(|&b| b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect())
    }

    /// List numeric entries of the root, sorted
    ///
    /// This is the only read whose failure aborts a capture.
    pub fn pids(&self) -> Result<Vec<i32>> {
        let pattern = self.root.join("[0-9]*");
        let pattern = pattern.to_str().ok_or_else(|| Error::ProcessListing {
            root: self.root.clone(),
            reason: "path is not valid UTF-8".into(),
        })?;

        let entries = glob::glob(pattern)?;
        let mut pids: Vec<i32> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::ProcessListing {
                root: self.root.clone(),
                reason: e.to_string(),
            })?;
            match entry
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse().ok())
            {
                Some(pid) => pids.push(pid),
                None => debug!("Ignoring non-pid entry {:?}", entry),
            }
        }

        if pids.is_empty() && !self.root.is_dir() {
            return Err(Error::ProcessListing {
                root: self.root.clone(),
                reason: "not a directory".into(),
            });
        }

        pids.sort_unstable();
        Ok(pids)
    }

    /// Single line value from a global file, eg. `sys/kernel/hostname`
    pub fn read_value(&self, name: &str) -> Option<String> {
        self.read_global(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}
