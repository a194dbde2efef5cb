//! Shared-Segment Resolver: System V shared memory
//!
//! Segments come from `/proc/sysvipc/shm`. Which processes use a segment is
//! not taken from the registry (`nattch` is only a count): a process is a
//! member once one of its own regions maps the segment, see
//! [`crate::maps::Region::sysv_segment`] for the naming contract.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use procfs::{FromBufRead, SharedMemorySegments, Shm};
use serde::{Deserialize, Serialize};

use crate::{maps::Region, pagemap::PageState, source::ProcRoot, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSegment {
    pub key: i32,
    pub id: u64,
    /// Size in bytes
    pub size: u64,
    /// Resident bytes, if the kernel exposes the column
    pub rss: Option<u64>,
    /// Swapped bytes, if the kernel exposes the column
    pub swap: Option<u64>,
    pub referencing_process_ids: BTreeSet<i32>,
    /// The segment's own page states, merged over all mappings
    pub pages: Vec<PageState>,
}

impl SharedSegment {
    pub fn new(key: i32, id: u64, size: u64) -> Self {
        Self {
            key,
            id,
            size,
            rss: None,
            swap: None,
            referencing_process_ids: BTreeSet::new(),
            pages: Vec::new(),
        }
    }

    pub fn resident_pages(&self) -> u64 {
        self.pages.iter().filter(|page| page.present()).count() as u64
    }

    /// Merge the pages seen through one mapping of this segment
    ///
    /// `first_page` is the mapping's offset into the segment, in pages: a
    /// segment can be mapped in pieces, eg. when part of it is mprotect'ed.
    /// Every mapping sees the same shmem pages, but a mapping only has
    /// entries for pages it faulted in, so a resident entry wins.
    pub fn merge_pages(&mut self, first_page: usize, pages: &[PageState], page_size: u64) {
        let len = (self.size.div_ceil(page_size) as usize).max(first_page + pages.len());
        if len > self.pages.len() {
            self.pages.resize(len, PageState::Unknown);
        }
        for (mine, theirs) in self.pages[first_page..].iter_mut().zip(pages) {
            let better = match (mine.present(), theirs.present()) {
                (false, true) => true,
                (true, _) => false,
                (false, false) => mine.is_unknown() && !theirs.is_unknown(),
            };
            if better {
                *mine = *theirs;
            }
        }
    }
}

impl From<Shm> for SharedSegment {
    fn from(shm: Shm) -> Self {
        let mut segment = SharedSegment::new(shm.key, shm.shmid, shm.size);
        segment.rss = Some(shm.rss);
        segment.swap = Some(shm.swap);
        segment
    }
}

fn parse_column(
    header: &[&str],
    values: &[&str],
    name: &str,
) -> std::result::Result<Option<u64>, String> {
    let Some(idx) = header.iter().position(|h| *h == name) else {
        return Ok(None);
    };
    let value = values.get(idx).ok_or_else(|| format!("missing {name}"))?;
    value
        .parse()
        .map(Some)
        .map_err(|e| format!("bad {name} {value:?}: {e}"))
}

/// Column lookup by name, for rows procfs rejects
///
/// Kernels before 4.x have no rss/swap columns, and procfs reads uids and
/// gids as 16 bit.
fn parse_columns(header: &[&str], line: &str) -> std::result::Result<SharedSegment, String> {
    let values: Vec<&str> = line.split_whitespace().collect();
    let key_idx = header
        .iter()
        .position(|h| *h == "key")
        .ok_or("no key column")?;
    let key: i32 = values
        .get(key_idx)
        .and_then(|v| v.parse().ok())
        .ok_or("bad key")?;
    let id = parse_column(header, &values, "shmid")?.ok_or("no shmid column")?;
    let size = parse_column(header, &values, "size")?.ok_or("no size column")?;

    let mut segment = SharedSegment::new(key, id, size);
    segment.rss = parse_column(header, &values, "rss")?;
    segment.swap = parse_column(header, &values, "swap")?;
    Ok(segment)
}

fn parse_segment(
    header_line: &str,
    header: &[&str],
    line: &str,
) -> std::result::Result<SharedSegment, String> {
    let parsed = SharedMemorySegments::from_buf_read(format!("{header_line}\n{line}").as_bytes());
    match parsed {
        Ok(SharedMemorySegments(shms)) => shms
            .into_iter()
            .next()
            .map(SharedSegment::from)
            .ok_or_else(|| "no segment".to_string()),
        Err(e) => parse_columns(header, line).map_err(|reason| format!("{reason} ({e})")),
    }
}

/// Parse the registry, header line first
pub fn parse_registry(content: &str) -> Vec<SharedSegment> {
    let mut lines = content.lines();
    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let header: Vec<&str> = header_line.split_whitespace().collect();

    lines
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match parse_segment(header_line, &header, line) {
            Ok(segment) => Some(segment),
            Err(reason) => {
                warn!("{}", Error::malformed("sysvipc/shm", idx + 2, reason));
                None
            }
        })
        .collect()
}

/// All segments of a snapshot, sorted by (key, id)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRegistry {
    segments: Vec<SharedSegment>,
}

impl SegmentRegistry {
    pub fn new(mut segments: Vec<SharedSegment>) -> Self {
        segments.sort_by_key(|s| (s.key, s.id));
        segments.dedup_by_key(|s| (s.key, s.id));
        Self { segments }
    }

    pub fn read(root: &ProcRoot) -> Result<Self> {
        let content = root.read_global("sysvipc/shm")?;
        Ok(Self::new(parse_registry(&content)))
    }

    pub fn get(&self, key: i32, id: u64) -> Option<&SharedSegment> {
        self.segments
            .binary_search_by_key(&(key, id), |s| (s.key, s.id))
            .ok()
            .map(|idx| &self.segments[idx])
    }

    fn get_mut(&mut self, key: i32, id: u64) -> Option<&mut SharedSegment> {
        self.segments
            .binary_search_by_key(&(key, id), |s| (s.key, s.id))
            .ok()
            .map(|idx| &mut self.segments[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedSegment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn for_each_page_mut<F: FnMut(&mut PageState)>(&mut self, mut f: F) {
        for segment in &mut self.segments {
            segment.pages.iter_mut().for_each(&mut f);
        }
    }

    /// Register the SysV mappings of one process
    ///
    /// `page_states` maps a region's start address to its page states, when known.
    /// Skipped regions have an empty list and only count for membership.
    /// A mapping naming a segment that is not in the registry is logged.
    pub fn register_process(
        &mut self,
        pid: i32,
        regions: &[Region],
        page_states: &BTreeMap<u64, Vec<PageState>>,
        page_size: u64,
    ) {
        for region in regions {
            let Some((key, id)) = region.sysv_segment() else {
                continue;
            };
            match self.get_mut(key, id) {
                Some(segment) => {
                    segment.referencing_process_ids.insert(pid);
                    let region_pages = page_states
                        .get(&region.virtual_start)
                        .filter(|pages| !pages.is_empty());
                    if let Some(region_pages) = region_pages {
                        let first_page = (region.file_offset / page_size) as usize;
                        segment.merge_pages(first_page, region_pages, page_size);
                    }
                }
                None => warn!("Can't find shm key {key} shmid {id} for pid {pid}"),
            }
        }
    }
}

/// Segments attached to the current process, detached on drop
pub struct AttachedSegments {
    addresses: Vec<(u64, usize)>,
}

impl AttachedSegments {
    /// Attach every segment read-only
    ///
    /// Segments that don't use swap are read one byte per page so that their
    /// pages show up in pagemap. Reading a swapped segment would bring it
    /// back into RAM, so it is only attached.
    pub fn attach(registry: &SegmentRegistry, page_size: u64, touch: bool) -> Self {
        let mut addresses = Vec::new();
        for segment in registry.iter() {
            let Ok(shmid) = libc::c_int::try_from(segment.id) else {
                warn!("shmid {} out of range", segment.id);
                continue;
            };

            let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), libc::SHM_RDONLY) };
            if ptr as isize == -1 {
                warn!(
                    "Can't attach to shmid {}: {}",
                    segment.id,
                    std::io::Error::last_os_error()
                );
                continue;
            }
            debug!("Attached shmid {} at {:p}", segment.id, ptr);

            if touch && segment.swap.unwrap_or(0) == 0 {
                let base = ptr as *const u8;
                let mut dummy = 0u8;
                for offset in (0..segment.size).step_by(page_size as usize) {
                    // SAFETY: the segment is mapped read-only for `size` bytes
                    dummy = dummy.wrapping_add(unsafe {
                        std::ptr::read_volatile(base.add(offset as usize))
                    });
                }
                std::hint::black_box(dummy);
            } else if touch {
                warn!(
                    "Skipping read for shm key:{} id:{} because it uses swap",
                    segment.key, segment.id
                );
            }

            addresses.push((segment.id, ptr as usize));
        }

        info!("Attached to {} shm segment(s)", addresses.len());
        Self { addresses }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl Drop for AttachedSegments {
    fn drop(&mut self) {
        for &(shmid, addr) in &self.addresses {
            let ret = unsafe { libc::shmdt(addr as *const libc::c_void) };
            if ret != 0 {
                warn!(
                    "shmdt failed for shmid {shmid}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}
