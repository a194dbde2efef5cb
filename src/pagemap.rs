//! Residency Extractor: `/proc/<pid>/pagemap` entries for each region
//!
//! Entry layout, from Documentation/admin-guide/mm/pagemap.rst:
//!
//! * Bits 0-54  page frame number (PFN) if present
//! * Bits 0-4   swap type if swapped
//! * Bits 5-54  swap offset if swapped
//! * Bit  55    pte is soft-dirty
//! * Bit  56    page exclusively mapped
//! * Bit  61    page is file-page or shared-anon
//! * Bit  62    page swapped
//! * Bit  63    page present

use std::{io, ops::Range};

use log::{debug, warn};
use procfs::{
    process::{MMapPath, MemoryPageFlags, PageInfo, PageMap, SwapPageFlags},
    ProcError, ProcResult,
};
use serde::{Deserialize, Serialize};

use crate::{maps::Region, source::ProcRoot, Error, Result};

/// State of one virtual page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageState {
    /// Backed by a physical frame
    Resident {
        /// `None` when the kernel hides frame numbers (no CAP_SYS_ADMIN)
        frame: Option<u64>,
        file_mapped: bool,
        soft_dirty: bool,
        exclusive: bool,
        /// Frame number outside of every "System RAM" range of the census
        frame_unknown: bool,
    },
    Swapped {
        swap_type: u64,
        swap_offset: u64,
        file_mapped: bool,
    },
    /// Never touched, or dropped from the page cache
    NotPresent { file_mapped: bool },
    /// Entry missing or undecodable
    Unknown,
}

impl From<PageInfo> for PageState {
    fn from(info: PageInfo) -> Self {
        match info {
            PageInfo::MemoryPage(flags) => {
                let file_mapped = flags.contains(MemoryPageFlags::FILE);
                if !flags.contains(MemoryPageFlags::PRESENT) {
                    return PageState::NotPresent { file_mapped };
                }
                let pfn = flags.get_page_frame_number().0;
                PageState::Resident {
                    frame: if pfn == 0 { None } else { Some(pfn) },
                    file_mapped,
                    soft_dirty: flags.contains(MemoryPageFlags::SOFT_DIRTY),
                    exclusive: flags.contains(MemoryPageFlags::MMAP_EXCLUSIVE),
                    frame_unknown: false,
                }
            }
            // present and swapped at once
            PageInfo::SwapPage(flags) if flags.contains(SwapPageFlags::PRESENT) => {
                PageState::Unknown
            }
            PageInfo::SwapPage(flags) => PageState::Swapped {
                swap_type: flags.get_swap_type(),
                swap_offset: flags.get_swap_offset(),
                file_mapped: flags.contains(SwapPageFlags::FILE),
            },
        }
    }
}

impl PageState {
    /// Decode one raw pagemap entry
    pub fn decode(entry: u64) -> Self {
        PageInfo::parse_info(entry).into()
    }

    pub fn present(&self) -> bool {
        matches!(self, PageState::Resident { .. })
    }

    pub fn swapped(&self) -> bool {
        matches!(self, PageState::Swapped { .. })
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, PageState::Unknown)
    }

    pub fn file_mapped(&self) -> bool {
        match *self {
            PageState::Resident { file_mapped, .. }
            | PageState::Swapped { file_mapped, .. }
            | PageState::NotPresent { file_mapped } => file_mapped,
            PageState::Unknown => false,
        }
    }

    pub fn frame_number(&self) -> Option<u64> {
        match *self {
            PageState::Resident { frame, .. } => frame,
            _ => None,
        }
    }

    /// Flag a resident frame depending on the census
    pub(crate) fn set_frame_unknown(&mut self, unknown: bool) {
        if let PageState::Resident { frame_unknown, .. } = self {
            *frame_unknown = unknown;
        }
    }
}

/// Decode a region's entries. Missing trailing entries become `Unknown`.
pub fn decode_region(infos: Vec<PageInfo>, page_count: u64) -> Vec<PageState> {
    let mut pages: Vec<PageState> = infos
        .into_iter()
        .take(page_count as usize)
        .map(PageState::from)
        .collect();
    pages.resize(page_count as usize, PageState::Unknown);
    pages
}

/// Entries of `range`, as many as the table holds when it ends early
fn read_entries(pagemap: &mut PageMap, range: Range<u64>) -> ProcResult<Vec<PageInfo>> {
    let range = range.start as usize..range.end as usize;
    match pagemap.get_range_info(range.clone()) {
        Err(ProcError::Io(e, _)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            let mut infos = Vec::new();
            for index in range {
                match pagemap.get_info(index) {
                    Ok(info) => infos.push(info),
                    Err(_) => break,
                }
            }
            Ok(infos)
        }
        other => other,
    }
}

/// Result of extracting one process
pub struct Residency {
    /// Page states of each region, `None` where the region's range could not be read
    pub pages: Vec<Option<Vec<PageState>>>,
}

/// Which regions to skip
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidencyOptions {
    /// Keep SysV regions with an empty page list
    pub skip_shm: bool,
}

/// Open the pagemap of `pid` for the duration of one extraction
pub fn open_pagemap(root: &ProcRoot, pid: i32) -> Result<PageMap> {
    root.process(pid)
        .and_then(|process| process.pagemap().map_err(|e| Error::from_proc(Some(pid), e)))
        .map_err(|e| Error::ResidencyUnavailable {
            pid,
            source: Box::new(e),
        })
}

/// Read pagemap entries for every region of a process
///
/// Only the byte range of each region is read: the pagemap covers the whole
/// virtual address space and is never read sequentially.
/// Fails with `ResidencyUnavailable` if the pagemap can't be opened,
/// individual regions that fail to read get `None`.
pub fn read_residency(
    root: &ProcRoot,
    pid: i32,
    regions: &[Region],
    page_size: u64,
    options: ResidencyOptions,
) -> Result<Residency> {
    let mut pagemap = open_pagemap(root, pid)?;

    let pages = regions
        .iter()
        .map(|region| {
            // can't scan Vsyscall, so skip it
            if region.pathname == MMapPath::Vsyscall {
                return Some(Vec::new());
            }
            if options.skip_shm && region.sysv_segment().is_some() {
                return Some(Vec::new());
            }

            let range = region.page_range(page_size);
            let page_count = range.end - range.start;
            match read_entries(&mut pagemap, range) {
                Ok(infos) => Some(decode_region(infos, page_count)),
                Err(e) => {
                    let e = Error::from_proc(Some(pid), e);
                    if e.is_vanished() {
                        debug!("pid {pid}: {e}");
                    } else {
                        warn!(
                            "pid {pid}: can't read pagemap for 0x{:x}-0x{:x}: {e}",
                            region.virtual_start, region.virtual_end
                        );
                    }
                    None
                }
            }
        })
        .collect();

    Ok(Residency { pages })
}
