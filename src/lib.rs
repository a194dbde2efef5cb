// https://www.kernel.org/doc/Documentation/vm/pagemap.txt
// https://www.kernel.org/doc/html/latest/admin-guide/mm/concepts.html
// cat /proc/$(pidof cat)/maps
// ipcs -m

//! Point in time snapshots of process memory, and diffs between them
//!
//! A capture reads, for every process under a procfs root, its mapped
//! regions and the residency of each page (`/proc/<pid>/maps`,
//! `/proc/<pid>/pagemap`), a census of physical RAM frames
//! (`/proc/iomem`, `/proc/kpagecount`, `/proc/kpageflags`) and the SysV
//! shared memory segments (`/proc/sysvipc/shm`).

pub mod capture;
pub mod census;
pub mod diff;
pub mod display;
pub mod error;
pub mod maps;
pub mod pagemap;
pub mod shm;
pub mod snapshot;
pub mod source;

pub use capture::{capture, CaptureOptions};
pub use diff::{diff, Delta};
pub use error::{Error, Result};
pub use snapshot::{Process, Snapshot};
pub use source::ProcRoot;
