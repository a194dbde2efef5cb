//! Physical-RAM Census: `/proc/iomem`, `/proc/kpagecount`, `/proc/kpageflags`
//!
//! Only frames inside "System RAM" ranges are read. Holes (MMIO, reserved,
//! ACPI tables...) are absent from the table, they are never zero-filled.

use std::ops::Range;

use log::{info, warn};
use procfs::{process::Pfn, FromBufRead, Iomem, KPageCount, KPageFlags, PhysicalPageFlags};
use serde::{Deserialize, Serialize};

use crate::{source::ProcRoot, Error, Result};

pub const SYSTEM_RAM: &str = "System RAM";

/// One line of iomem. `end` is inclusive, as printed by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalRange {
    pub start: u64,
    pub end: u64,
    pub name: String,
    /// Nesting level, 0 for top level ranges
    pub depth: usize,
}

impl PhysicalRange {
    /// Frames fully or partially starting in this range
    pub fn frames(&self, page_size: u64) -> Range<u64> {
        let start = self.start / page_size;
        let end = (self.end.saturating_add(1) / page_size).max(start);
        start..end
    }

    pub fn is_ram(&self) -> bool {
        self.name == SYSTEM_RAM
    }
}

/// Parse iomem. Malformed lines are logged and skipped.
pub fn parse_iomem(content: &str) -> Vec<PhysicalRange> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match Iomem::from_buf_read(line.as_bytes()) {
            Ok(Iomem(maps)) => maps.into_iter().next().map(|(depth, map)| PhysicalRange {
                start: map.address.0,
                end: map.address.1,
                name: map.name.trim().to_string(),
                depth,
            }),
            Err(e) => {
                warn!("{}", Error::malformed("iomem", idx + 1, format!("{line:?}: {e}")));
                None
            }
        })
        .collect()
}

/// Global per-frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRecord {
    pub reference_count: u64,
    pub flags_bitmask: u64,
}

impl FrameRecord {
    pub fn flags(&self) -> PhysicalPageFlags {
        PhysicalPageFlags::from_bits_retain(self.flags_bitmask)
    }
}

/// Contiguous frames of one RAM range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamFrames {
    pub first_frame: u64,
    pub counts: Vec<u64>,
    pub flags: Vec<u64>,
}

impl RamFrames {
    pub fn frames(&self) -> Range<u64> {
        self.first_frame..self.first_frame + self.counts.len() as u64
    }
}

/// Frame number -> FrameRecord, populated only for System RAM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTable {
    /// Sorted by first frame, non overlapping
    ranges: Vec<RamFrames>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub frames: u64,
    pub referenced: u64,
    pub huge: u64,
    pub anon: u64,
}

impl FrameTable {
    pub fn from_ranges(mut ranges: Vec<RamFrames>) -> Self {
        ranges.sort_by_key(|r| r.first_frame);
        Self { ranges }
    }

    pub fn ranges(&self) -> &[RamFrames] {
        &self.ranges
    }

    fn find(&self, frame: u64) -> Option<&RamFrames> {
        let idx = self
            .ranges
            .partition_point(|r| r.first_frame + r.counts.len() as u64 <= frame);
        self.ranges
            .get(idx)
            .filter(|r| r.frames().contains(&frame))
    }

    pub fn get(&self, frame: u64) -> Option<FrameRecord> {
        let ram = self.find(frame)?;
        let idx = (frame - ram.first_frame) as usize;
        Some(FrameRecord {
            reference_count: *ram.counts.get(idx)?,
            flags_bitmask: *ram.flags.get(idx)?,
        })
    }

    /// Check a table that did not come from `read_frames`
    pub fn validate(&self) -> std::result::Result<(), String> {
        for ram in &self.ranges {
            if ram.counts.len() != ram.flags.len() {
                return Err(format!(
                    "frames from {}: {} reference counts but {} flags",
                    ram.first_frame,
                    ram.counts.len(),
                    ram.flags.len()
                ));
            }
        }
        for (previous, next) in self.ranges.iter().zip(self.ranges.iter().skip(1)) {
            if next.first_frame < previous.frames().end {
                return Err(format!(
                    "frames from {} overlap frames from {}",
                    next.first_frame, previous.first_frame
                ));
            }
        }
        Ok(())
    }

    pub fn contains(&self, frame: u64) -> bool {
        self.find(frame).is_some()
    }

    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|r| r.counts.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, FrameRecord)> + '_ {
        self.ranges.iter().flat_map(|ram| {
            ram.counts
                .iter()
                .zip(&ram.flags)
                .enumerate()
                .map(|(idx, (&reference_count, &flags_bitmask))| {
                    (
                        ram.first_frame + idx as u64,
                        FrameRecord {
                            reference_count,
                            flags_bitmask,
                        },
                    )
                })
        })
    }

    pub fn summary(&self) -> FrameSummary {
        let mut summary = FrameSummary::default();
        for (_, record) in self.iter() {
            let flags = record.flags();
            summary.frames += 1;
            if record.reference_count > 0 {
                summary.referenced += 1;
            }
            if flags.intersects(PhysicalPageFlags::HUGE | PhysicalPageFlags::THP) {
                summary.huge += 1;
            }
            if flags.contains(PhysicalPageFlags::ANON) {
                summary.anon += 1;
            }
        }
        summary
    }
}

/// Keep RAM ranges, sorted, dropping empty and overlapping ones
pub fn ram_ranges(iomem: &[PhysicalRange], page_size: u64) -> Vec<PhysicalRange> {
    let mut ram: Vec<PhysicalRange> = iomem.iter().filter(|r| r.is_ram()).cloned().collect();
    ram.sort_by_key(|r| r.start);

    let mut result: Vec<PhysicalRange> = Vec::with_capacity(ram.len());
    for range in ram {
        if range.end < range.start || range.frames(page_size).is_empty() {
            // unprivileged readers see 00000000-00000000
            warn!(
                "Ignoring empty RAM range 0x{:x}-0x{:x}, is iomem readable?",
                range.start, range.end
            );
            continue;
        }
        if let Some(previous) = result.last() {
            if range.frames(page_size).start < previous.frames(page_size).end {
                warn!(
                    "Ignoring RAM range 0x{:x}-0x{:x} overlapping 0x{:x}-0x{:x}",
                    range.start, range.end, previous.start, previous.end
                );
                continue;
            }
        }
        result.push(range);
    }
    result
}

/// Read kpagecount and kpageflags for the given RAM ranges
pub fn read_frames(root: &ProcRoot, ram: &[PhysicalRange], page_size: u64) -> Result<FrameTable> {
    let mut kpagecount =
        KPageCount::from_custom_root(root.path()).map_err(|e| Error::from_proc(None, e))?;
    let mut kpageflags =
        KPageFlags::from_custom_root(root.path()).map_err(|e| Error::from_proc(None, e))?;

    let mut ranges = Vec::with_capacity(ram.len());
    for range in ram {
        let frames = range.frames(page_size);
        let unavailable = |e| Error::PhysicalRangeUnavailable {
            start: range.start,
            end: range.end,
            source: Box::new(Error::from_proc(None, e)),
        };

        let counts = kpagecount
            .get_count_in_range(Pfn(frames.start), Pfn(frames.end))
            .map_err(unavailable)?;
        let flags = kpageflags
            .get_range_info(Pfn(frames.start), Pfn(frames.end))
            .map_err(unavailable)?
            .into_iter()
            .map(|flags| flags.bits())
            .collect();

        ranges.push(RamFrames {
            first_frame: frames.start,
            counts,
            flags,
        });
    }

    Ok(FrameTable::from_ranges(ranges))
}

/// Output of the census
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Census {
    pub iomem: Vec<PhysicalRange>,
    /// `None` if the frame tables could not be read
    pub frames: Option<FrameTable>,
}

/// Run the whole census once
///
/// An unreadable iomem is an error. Unreadable frame tables only cost the
/// frame data: the error is logged and `frames` is `None`.
pub fn run_census(root: &ProcRoot, page_size: u64) -> Result<Census> {
    let chrono = std::time::Instant::now();

    let iomem = parse_iomem(&root.read_global("iomem")?);
    let ram = ram_ranges(&iomem, page_size);

    let frames = match read_frames(root, &ram, page_size) {
        Ok(frames) => Some(frames),
        Err(e) => {
            warn!("No frame data for this snapshot: {e}");
            None
        }
    };

    info!(
        "Census: {} RAM ranges, {} frames in {:?}",
        ram.len(),
        frames.as_ref().map(|f| f.len()).unwrap_or(0),
        chrono.elapsed()
    );

    Ok(Census { iomem, frames })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const IOMEM: &str = "\
00000000-00000fff : Reserved
00001000-0009fbff : System RAM
0009fc00-0009ffff : Reserved
000a0000-000bffff : PCI Bus 0000:00
00100000-bffdffff : System RAM
  5a000000-5ae00d87 : Kernel code
  5b000000-5b5a1fff : Kernel rodata
bffe0000-bfffffff : Reserved
fee00000-fee00fff : Local APIC
100000000-23fffffff : System RAM
";

    #[test]
    fn test_parse_iomem() {
        let iomem = parse_iomem(IOMEM);
        assert_eq!(iomem.len(), 10);
        assert_eq!(
            iomem[5],
            PhysicalRange {
                start: 0x5a000000,
                end: 0x5ae00d87,
                name: "Kernel code".into(),
                depth: 1
            }
        );

        let ram = ram_ranges(&iomem, 4096);
        assert_eq!(ram.len(), 3);
        assert_eq!(ram[0].frames(4096), 1..0x9f);
        assert_eq!(ram[1].frames(4096), 0x100..0xbffe0);
        assert_eq!(ram[2].frames(4096), 0x100000..0x240000);
    }

    #[test]
    fn test_unprivileged_iomem_is_empty() {
        let iomem = parse_iomem("00000000-00000000 : System RAM\n00000000-00000000 : Reserved\n");
        assert!(ram_ranges(&iomem, 4096).is_empty());
    }

    #[test]
    fn test_malformed_iomem_lines() {
        let iomem = parse_iomem("garbage\n00001000-0009fbff : System RAM\nzz-10 : Foo\n");
        assert_eq!(iomem.len(), 1);
    }

    #[test]
    fn test_validate_rejects_mismatched_lengths() {
        let table = FrameTable::from_ranges(vec![RamFrames {
            first_frame: 10,
            counts: vec![1, 2, 3],
            flags: vec![0],
        }]);
        assert!(table.validate().is_err());
        // no panic on the missing flags
        assert_eq!(table.get(12), None);
        assert!(table.get(10).is_some());

        let table = FrameTable::from_ranges(vec![
            RamFrames {
                first_frame: 10,
                counts: vec![1, 2],
                flags: vec![0, 0],
            },
            RamFrames {
                first_frame: 11,
                counts: vec![1],
                flags: vec![0],
            },
        ]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_read_frames_from_tables() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, values: &[u64]| {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
            std::fs::write(dir.path().join(name), bytes).unwrap();
        };
        write("kpagecount", &[9, 1, 2, 0, 5]);
        write("kpageflags", &[0, 1 << 12, 0, 0, 1 << 22]);
        let root = ProcRoot::new(dir.path());

        let ram = ram_ranges(&parse_iomem("00001000-00002fff : System RAM\n"), 4096);
        let table = read_frames(&root, &ram, 4096).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.validate().is_ok());
        assert_eq!(
            table.get(1),
            Some(FrameRecord {
                reference_count: 1,
                flags_bitmask: 1 << 12
            })
        );
        assert!(table.get(1).unwrap().flags().contains(PhysicalPageFlags::ANON));

        // a range past the end of the tables
        let ram = ram_ranges(&parse_iomem("00001000-00009fff : System RAM\n"), 4096);
        let err = read_frames(&root, &ram, 4096).unwrap_err();
        assert!(matches!(err, Error::PhysicalRangeUnavailable { start: 0x1000, .. }));
    }

    #[test]
    fn test_frame_table_lookup() {
        let table = FrameTable::from_ranges(vec![
            RamFrames {
                first_frame: 100,
                counts: vec![1, 0],
                flags: vec![1 << 12, 0],
            },
            RamFrames {
                first_frame: 10,
                counts: vec![2, 3, 4],
                flags: vec![0, 0, 1 << 22],
            },
        ]);

        assert_eq!(table.len(), 5);
        assert_eq!(
            table.get(11),
            Some(FrameRecord {
                reference_count: 3,
                flags_bitmask: 0
            })
        );
        assert_eq!(table.get(13), None);
        assert_eq!(table.get(9), None);
        assert_eq!(table.get(101).map(|r| r.reference_count), Some(0));
        assert!(!table.contains(102));

        let frames: Vec<u64> = table.iter().map(|(frame, _)| frame).collect();
        assert_eq!(frames, vec![10, 11, 12, 100, 101]);

        let summary = table.summary();
        assert_eq!(
            summary,
            FrameSummary {
                frames: 5,
                referenced: 4,
                huge: 1,
                anon: 1
            }
        );
    }
}
