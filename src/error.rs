use std::{io, path::PathBuf};

use procfs::ProcError;

/// Everything that can go wrong while capturing or loading a snapshot.
///
/// Most variants are recoverable at the level of one process or one file:
/// the capture pass logs them and moves on. Only a failure to list processes
/// is fatal to a whole capture.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The process exited between listing and reading one of its files.
    #[error("Process {pid} vanished")]
    ProcessVanished { pid: i32 },

    /// A pseudo-file exists but can't be read by us.
    #[error("Permission denied: {}", .path.display())]
    PermissionDenied { path: PathBuf },

    /// The pagemap of a process can't be opened or read.
    #[error("Residency unavailable for pid {pid}: {source}")]
    ResidencyUnavailable {
        pid: i32,
        #[source]
        source: Box<Error>,
    },

    /// One line or entry of a pseudo-file failed to parse.
    #[error("Malformed record in {source_name} line {line}: {reason}")]
    MalformedRecord {
        source_name: String,
        line: usize,
        reason: String,
    },

    /// A "System RAM" range can't be read from kpagecount/kpageflags.
    #[error("Physical range 0x{start:x}-0x{end:x} unavailable: {source}")]
    PhysicalRangeUnavailable {
        start: u64,
        end: u64,
        #[source]
        source: Box<Error>,
    },

    /// The process directory can't be listed at all.
    #[error("Can't list processes under {}: {reason}", .root.display())]
    ProcessListing { root: PathBuf, reason: String },

    /// A snapshot store is not in the expected state.
    #[error("Invalid snapshot store {}: {reason}", .path.display())]
    InvalidStore { path: PathBuf, reason: String },

    /// procfs could not make sense of a file
    #[error("procfs: {0}")]
    Procfs(#[source] ProcError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bad glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Can't build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an I/O error on a file that belongs to process `pid`
    pub fn from_process_io(pid: i32, path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Error::ProcessVanished { pid },
            io::ErrorKind::PermissionDenied => Error::PermissionDenied { path },
            _ if source.raw_os_error() == Some(libc::ESRCH) => Error::ProcessVanished { pid },
            _ => Error::Io { path, source },
        }
    }

    /// Classify an I/O error on a global (non per-process) file
    pub fn from_io(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied { path },
            _ => Error::Io { path, source },
        }
    }

    /// Classify an error returned by procfs
    ///
    /// With a `pid`, a missing file means the process exited, procfs already
    /// reports ESRCH on a path as `NotFound`.
    pub fn from_proc(pid: Option<i32>, source: ProcError) -> Self {
        match (pid, source) {
            (Some(pid), ProcError::NotFound(_)) => Error::ProcessVanished { pid },
            (None, ProcError::NotFound(path)) => Error::Io {
                path: path.unwrap_or_default(),
                source: io::ErrorKind::NotFound.into(),
            },
            (_, ProcError::PermissionDenied(path)) => Error::PermissionDenied {
                path: path.unwrap_or_default(),
            },
            (Some(pid), ProcError::Io(source, path)) => {
                Error::from_process_io(pid, path.unwrap_or_default(), source)
            }
            (None, ProcError::Io(source, path)) => Error::from_io(path.unwrap_or_default(), source),
            (_, other) => Error::Procfs(other),
        }
    }

    pub fn malformed(source_name: impl Into<String>, line: usize, reason: impl Into<String>) -> Self {
        Error::MalformedRecord {
            source_name: source_name.into(),
            line,
            reason: reason.into(),
        }
    }

    /// Races with exiting processes are expected and not worth a warning
    pub fn is_vanished(&self) -> bool {
        match self {
            Error::ProcessVanished { .. } => true,
            Error::ResidencyUnavailable { source, .. } => source.is_vanished(),
            _ => false,
        }
    }
}
