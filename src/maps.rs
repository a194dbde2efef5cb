//! Address-Space Reader: parse `/proc/<pid>/maps` into ordered regions
//!
//! Format of one line (see `man 5 proc`):
//!
//! ```text
//! address           perms offset  dev   inode       pathname
//! 00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
//! 7f2c3a1d4000-7f2c3a1f5000 rw-p 00000000 00:00 0
//! 7f2c3a400000-7f2c3e400000 rw-s 00000000 00:01 32769       /SYSV0000162e (deleted)
//! ```
//!
//! Lines are decoded by procfs one at a time, so that a malformed line only
//! costs that line.

use log::warn;
use procfs::{
    process::{MMPermissions, MMapPath, MemoryMap, MemoryMaps},
    FromBufRead,
};
use serde::{Deserialize, Serialize};

use crate::{source::ProcRoot, Error, Result};

/// One line of maps
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub virtual_start: u64,
    pub virtual_end: u64,
    pub perms: MMPermissions,
    pub file_offset: u64,
    /// (major, minor)
    pub device: (i32, i32),
    pub inode: u64,
    /// `MMapPath::Vsys(key)` for SysV segments, the shmid is `inode`
    pub pathname: MMapPath,
}

impl From<MemoryMap> for Region {
    fn from(map: MemoryMap) -> Self {
        Self {
            virtual_start: map.address.0,
            virtual_end: map.address.1,
            perms: map.perms,
            file_offset: map.offset,
            device: map.dev,
            inode: map.inode,
            pathname: map.pathname,
        }
    }
}

impl Region {
    pub fn size(&self) -> u64 {
        self.virtual_end - self.virtual_start
    }

    /// Virtual page numbers covered by this region
    pub fn page_range(&self, page_size: u64) -> std::ops::Range<u64> {
        let start = self.virtual_start / page_size;
        let end = (self.virtual_end / page_size).max(start);
        start..end
    }

    pub fn page_count(&self, page_size: u64) -> u64 {
        let range = self.page_range(page_size);
        range.end - range.start
    }

    /// `(key, shmid)` of the SysV segment mapped here, if any
    ///
    /// The kernel names the shmem file of a segment `SYSV%08x`, the key
    /// printed as 32 bit hex, so keys above `i32::MAX` come back negative.
    /// The shmid is not in the name, it is the inode.
    pub fn sysv_segment(&self) -> Option<(i32, u64)> {
        match self.pathname {
            MMapPath::Vsys(key) => Some((key, self.inode)),
            _ => None,
        }
    }

    /// Same range and backing, permissions may differ
    pub fn is_comparable(&self, other: &Region) -> bool {
        self.virtual_start == other.virtual_start
            && self.virtual_end == other.virtual_end
            && self.pathname == other.pathname
    }
}

/// procfs slices the 8 hex digits after `/SYSV` without checking the length
fn check_sysv_name(pathname: &str) -> std::result::Result<(), String> {
    let pathname = pathname.trim();
    if pathname.starts_with("/SYSV") && pathname.get(5..13).is_none() {
        return Err(format!("truncated SysV name {pathname:?}"));
    }
    Ok(())
}

pub fn parse_region(line: &str) -> std::result::Result<Region, String> {
    let fields: Vec<&str> = line.splitn(6, ' ').collect();
    if let Some(pathname) = fields.get(5) {
        check_sysv_name(pathname)?;
    }

    // anonymous regions may come without the separator before the empty pathname
    let line = if fields.len() == 5 {
        format!("{line} ")
    } else {
        line.to_string()
    };

    let maps = MemoryMaps::from_buf_read(line.as_bytes()).map_err(|e| e.to_string())?;
    let region: Region = maps
        .into_iter()
        .next()
        .map(Region::from)
        .ok_or_else(|| "no mapping".to_string())?;

    if region.virtual_start >= region.virtual_end {
        return Err(format!(
            "empty or reversed range {:x}-{:x}",
            region.virtual_start, region.virtual_end
        ));
    }
    Ok(region)
}

/// Parse a whole maps file
///
/// Malformed lines are logged and skipped. Regions are sorted by start
/// address, and a region overlapping its predecessor is dropped as malformed.
pub fn parse_maps(source_name: &str, content: &str) -> Vec<Region> {
    let mut regions: Vec<Region> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_region(line) {
            Ok(region) => regions.push(region),
            Err(reason) => warn!("{}", Error::malformed(source_name, idx + 1, reason)),
        }
    }

    regions.sort_by_key(|region| region.virtual_start);

    let mut result: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        if let Some(previous) = result.last() {
            if region.virtual_start < previous.virtual_end {
                warn!(
                    "{}",
                    Error::malformed(
                        source_name,
                        0,
                        format!(
                            "region 0x{:x}-0x{:x} overlaps 0x{:x}-0x{:x}",
                            region.virtual_start,
                            region.virtual_end,
                            previous.virtual_start,
                            previous.virtual_end
                        )
                    )
                );
                continue;
            }
        }
        result.push(region);
    }

    result
}

/// Read and parse `<root>/<pid>/maps`
pub fn read_regions(root: &ProcRoot, pid: i32) -> Result<Vec<Region>> {
    let content = root.read_process(pid, "maps")?;
    let source_name = root.process_path(pid, "maps").display().to_string();
    Ok(parse_maps(&source_name, &content))
}
