//! Diff Engine: compare two snapshots
//!
//! Pure function of its inputs, no I/O. Processes are compared in parallel
//! and merged by pid.

use std::collections::{BTreeMap, BTreeSet};

use itertools::{EitherOrBoth, Itertools};
use procfs::process::{MMPermissions, MMapPath};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    maps::Region,
    pagemap::PageState,
    shm::SharedSegment,
    snapshot::{Process, Snapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageChangeKind {
    BecameResident { frame: Option<u64> },
    Evicted { frame: Option<u64> },
    /// Resident in both, on another frame: migration or copy
    FrameChanged { before: u64, after: u64 },
    /// One side has no usable state for this page
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageChange {
    /// Page index inside the region
    pub index: u64,
    pub virtual_address: u64,
    pub kind: PageChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageDelta {
    /// Pages that are not unchanged
    Compared(Vec<PageChange>),
    /// Page states missing on at least one side
    Unknown,
    /// Region added or removed
    NotCompared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionChange {
    Unchanged,
    PermissionChanged {
        before: MMPermissions,
        after: MMPermissions,
    },
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDelta {
    pub virtual_start: u64,
    pub virtual_end: u64,
    pub pathname: MMapPath,
    pub change: RegionChange,
    pub pages: PageDelta,
}

impl RegionDelta {
    fn has_changes(&self) -> bool {
        match &self.pages {
            _ if self.change != RegionChange::Unchanged => true,
            PageDelta::Compared(pages) => pages
                .iter()
                .any(|page| page.kind != PageChangeKind::Unknown),
            PageDelta::Unknown | PageDelta::NotCompared => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessChanges {
    pub cmdline_changed: bool,
    /// Regions that are not unchanged, or that have page changes
    pub regions: Vec<RegionDelta>,
    pub unchanged_regions: usize,
}

impl ProcessChanges {
    pub fn has_changes(&self) -> bool {
        self.cmdline_changed || self.regions.iter().any(|r| r.has_changes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessDelta {
    Added,
    Removed,
    /// Partial on at least one side, or only unknown pages to report
    Unknown,
    Changed(ProcessChanges),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentChange {
    Added { pids: BTreeSet<i32> },
    Removed { pids: BTreeSet<i32> },
    Membership {
        gained: BTreeSet<i32>,
        lost: BTreeSet<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDelta {
    pub key: i32,
    pub id: u64,
    pub change: SegmentChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramesDelta {
    /// Frame data missing on at least one side
    Unknown,
    Compared {
        changed: u64,
        only_in_a: u64,
        only_in_b: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Only processes with something to report
    pub processes: BTreeMap<i32, ProcessDelta>,
    pub segments: Vec<SegmentDelta>,
    pub frames: FramesDelta,
}

impl Delta {
    /// No added, removed or changed entry. `Unknown` entries don't count.
    pub fn is_empty(&self) -> bool {
        let processes = self.processes.values().all(|delta| match delta {
            ProcessDelta::Added | ProcessDelta::Removed => false,
            ProcessDelta::Unknown => true,
            ProcessDelta::Changed(changes) => !changes.has_changes(),
        });
        let frames = match self.frames {
            FramesDelta::Unknown => true,
            FramesDelta::Compared {
                changed,
                only_in_a,
                only_in_b,
            } => changed == 0 && only_in_a == 0 && only_in_b == 0,
        };
        processes && frames && self.segments.is_empty()
    }

    pub fn added(&self) -> impl Iterator<Item = i32> + '_ {
        self.pids_with(|d| matches!(d, ProcessDelta::Added))
    }

    pub fn removed(&self) -> impl Iterator<Item = i32> + '_ {
        self.pids_with(|d| matches!(d, ProcessDelta::Removed))
    }

    fn pids_with<F>(&self, f: F) -> impl Iterator<Item = i32> + '_
    where
        F: Fn(&ProcessDelta) -> bool + 'static,
    {
        self.processes
            .iter()
            .filter(move |(_, delta)| f(*delta))
            .map(|(&pid, _)| pid)
    }
}

fn classify(before: &PageState, after: &PageState) -> Option<PageChangeKind> {
    if before == after {
        return None;
    }
    if before.is_unknown() || after.is_unknown() {
        return Some(PageChangeKind::Unknown);
    }
    match (before.present(), after.present()) {
        (false, false) => None,
        (false, true) => Some(PageChangeKind::BecameResident {
            frame: after.frame_number(),
        }),
        (true, false) => Some(PageChangeKind::Evicted {
            frame: before.frame_number(),
        }),
        (true, true) => match (before.frame_number(), after.frame_number()) {
            (Some(before), Some(after)) if before != after => {
                Some(PageChangeKind::FrameChanged { before, after })
            }
            _ => None,
        },
    }
}

/// Pairwise comparison of the pages of two comparable regions
pub fn diff_pages(
    region: &Region,
    before: &[PageState],
    after: &[PageState],
    page_size: u64,
) -> Vec<PageChange> {
    let base = region.page_range(page_size).start * page_size;
    before
        .iter()
        .zip_longest(after)
        .enumerate()
        .filter_map(|(index, pair)| {
            let kind = match pair {
                EitherOrBoth::Both(before, after) => classify(before, after)?,
                EitherOrBoth::Left(_) | EitherOrBoth::Right(_) => PageChangeKind::Unknown,
            };
            Some(PageChange {
                index: index as u64,
                virtual_address: base + index as u64 * page_size,
                kind,
            })
        })
        .collect()
}

fn region_only(region: &Region, change: RegionChange) -> RegionDelta {
    RegionDelta {
        virtual_start: region.virtual_start,
        virtual_end: region.virtual_end,
        pathname: region.pathname.clone(),
        change,
        pages: PageDelta::NotCompared,
    }
}

/// Ordered merge of both region lists on start address
pub fn diff_regions(a: &Process, b: &Process, page_size: u64) -> ProcessChanges {
    let mut changes = ProcessChanges {
        cmdline_changed: a.cmdline != b.cmdline,
        ..Default::default()
    };

    for pair in a
        .regions
        .iter()
        .merge_join_by(&b.regions, |x, y| x.virtual_start.cmp(&y.virtual_start))
    {
        match pair {
            EitherOrBoth::Left(region) => {
                changes.regions.push(region_only(region, RegionChange::Removed))
            }
            EitherOrBoth::Right(region) => {
                changes.regions.push(region_only(region, RegionChange::Added))
            }
            EitherOrBoth::Both(before, after) if !before.is_comparable(after) => {
                changes.regions.push(region_only(before, RegionChange::Removed));
                changes.regions.push(region_only(after, RegionChange::Added));
            }
            EitherOrBoth::Both(before, after) => {
                let change = if before.perms == after.perms {
                    RegionChange::Unchanged
                } else {
                    RegionChange::PermissionChanged {
                        before: before.perms,
                        after: after.perms,
                    }
                };
                // `None` when both sides lack page states
                let pages = match (a.pages(before), b.pages(after)) {
                    (Some(pages_a), Some(pages_b)) => Some(PageDelta::Compared(diff_pages(
                        before, pages_a, pages_b, page_size,
                    ))),
                    (None, None) => None,
                    _ => Some(PageDelta::Unknown),
                };

                let nothing = change == RegionChange::Unchanged
                    && match &pages {
                        None => true,
                        Some(PageDelta::Compared(p)) => p.is_empty(),
                        Some(_) => false,
                    };
                if nothing {
                    changes.unchanged_regions += 1;
                } else {
                    changes.regions.push(RegionDelta {
                        virtual_start: after.virtual_start,
                        virtual_end: after.virtual_end,
                        pathname: after.pathname.clone(),
                        change,
                        pages: pages.unwrap_or(PageDelta::Unknown),
                    });
                }
            }
        }
    }

    changes
}

fn diff_process(a: Option<&Process>, b: Option<&Process>, page_size: u64) -> Option<ProcessDelta> {
    match (a, b) {
        (None, None) => None,
        (None, Some(_)) => Some(ProcessDelta::Added),
        (Some(_), None) => Some(ProcessDelta::Removed),
        (Some(a), Some(b)) if a.is_partial() || b.is_partial() => {
            if a == b {
                None
            } else {
                Some(ProcessDelta::Unknown)
            }
        }
        (Some(a), Some(b)) => {
            let changes = diff_regions(a, b, page_size);
            if changes.has_changes() {
                Some(ProcessDelta::Changed(changes))
            } else if !changes.regions.is_empty() {
                Some(ProcessDelta::Unknown)
            } else {
                None
            }
        }
    }
}

fn diff_segments<'a>(
    a: impl Iterator<Item = &'a SharedSegment>,
    b: impl Iterator<Item = &'a SharedSegment>,
) -> Vec<SegmentDelta> {
    a.merge_join_by(b, |x, y| (x.key, x.id).cmp(&(y.key, y.id)))
        .filter_map(|pair| {
            let (key, id, change) = match pair {
                EitherOrBoth::Left(s) => (
                    s.key,
                    s.id,
                    SegmentChange::Removed {
                        pids: s.referencing_process_ids.clone(),
                    },
                ),
                EitherOrBoth::Right(s) => (
                    s.key,
                    s.id,
                    SegmentChange::Added {
                        pids: s.referencing_process_ids.clone(),
                    },
                ),
                EitherOrBoth::Both(before, after) => {
                    let gained: BTreeSet<i32> = after
                        .referencing_process_ids
                        .difference(&before.referencing_process_ids)
                        .copied()
                        .collect();
                    let lost: BTreeSet<i32> = before
                        .referencing_process_ids
                        .difference(&after.referencing_process_ids)
                        .copied()
                        .collect();
                    if gained.is_empty() && lost.is_empty() {
                        return None;
                    }
                    (after.key, after.id, SegmentChange::Membership { gained, lost })
                }
            };
            Some(SegmentDelta { key, id, change })
        })
        .collect()
}

fn diff_frames(a: &Snapshot, b: &Snapshot) -> FramesDelta {
    let (Some(frames_a), Some(frames_b)) = (a.frames(), b.frames()) else {
        return FramesDelta::Unknown;
    };

    let mut changed = 0;
    let mut only_in_a = 0;
    for (frame, record) in frames_a.iter() {
        match frames_b.get(frame) {
            Some(other) if other != record => changed += 1,
            Some(_) => (),
            None => only_in_a += 1,
        }
    }
    let only_in_b = frames_b
        .iter()
        .filter(|(frame, _)| !frames_a.contains(*frame))
        .count() as u64;

    FramesDelta::Compared {
        changed,
        only_in_a,
        only_in_b,
    }
}

/// Compare `a` (earlier) with `b` (later)
pub fn diff(a: &Snapshot, b: &Snapshot) -> Delta {
    let page_size = b.page_size();
    let pids: Vec<i32> = a
        .processes()
        .keys()
        .merge(b.processes().keys())
        .dedup()
        .copied()
        .collect();

    let processes: BTreeMap<i32, ProcessDelta> = pids
        .par_iter()
        .filter_map(|&pid| {
            diff_process(a.process(pid), b.process(pid), page_size).map(|delta| (pid, delta))
        })
        .collect();

    Delta {
        processes,
        segments: diff_segments(a.segments().iter(), b.segments().iter()),
        frames: diff_frames(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{maps::parse_region, shm::SegmentRegistry, snapshot::HostIdentity};
    use pretty_assertions::assert_eq;
    use std::time::SystemTime;

    fn resident(frame: u64) -> PageState {
        PageState::Resident {
            frame: Some(frame),
            file_mapped: false,
            soft_dirty: false,
            exclusive: true,
            frame_unknown: false,
        }
    }

    const ABSENT: PageState = PageState::NotPresent { file_mapped: false };

    fn snapshot(processes: Vec<Process>, segments: Vec<SharedSegment>) -> Snapshot {
        Snapshot::new(
            HostIdentity {
                hostname: "test".into(),
                kernel_release: "6.1.0".into(),
                page_size: 4096,
            },
            SystemTime::UNIX_EPOCH,
            processes.into_iter().map(|p| (p.pid, p)).collect(),
            Vec::new(),
            None,
            SegmentRegistry::new(segments),
        )
    }

    fn region(line: &str) -> Region {
        parse_region(line).unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&ABSENT, &ABSENT), None);
        assert_eq!(classify(&resident(1), &resident(1)), None);
        assert_eq!(
            classify(&ABSENT, &resident(3)),
            Some(PageChangeKind::BecameResident { frame: Some(3) })
        );
        assert_eq!(
            classify(&resident(3), &PageState::Swapped {
                swap_type: 0,
                swap_offset: 12,
                file_mapped: false
            }),
            Some(PageChangeKind::Evicted { frame: Some(3) })
        );
        assert_eq!(
            classify(&resident(3), &resident(4)),
            Some(PageChangeKind::FrameChanged { before: 3, after: 4 })
        );
        assert_eq!(
            classify(&PageState::Unknown, &resident(4)),
            Some(PageChangeKind::Unknown)
        );
    }

    #[test]
    fn test_migrated_page_and_new_region() {
        let r1 = region("00001000-00003000 rw-p 00000000 00:00 0");
        let r2 = region("00003000-00004000 rw-p 00000000 00:00 0");

        let a = snapshot(
            vec![Process::new(
                1,
                vec!["p1".into()],
                vec![r1.clone()],
                vec![Some(vec![resident(10), resident(11)])],
            )],
            Vec::new(),
        );
        let b = snapshot(
            vec![Process::new(
                1,
                vec!["p1".into()],
                vec![r1, r2],
                vec![Some(vec![resident(10), resident(12)]), Some(vec![ABSENT])],
            )],
            Vec::new(),
        );

        let delta = diff(&a, &b);
        let Some(ProcessDelta::Changed(changes)) = delta.processes.get(&1) else {
            panic!("expected changes for pid 1: {delta:?}");
        };
        assert_eq!(changes.unchanged_regions, 0);
        assert_eq!(
            changes.regions,
            vec![
                RegionDelta {
                    virtual_start: 0x1000,
                    virtual_end: 0x3000,
                    pathname: MMapPath::Anonymous,
                    change: RegionChange::Unchanged,
                    pages: PageDelta::Compared(vec![PageChange {
                        index: 1,
                        virtual_address: 0x2000,
                        kind: PageChangeKind::FrameChanged {
                            before: 11,
                            after: 12
                        },
                    }]),
                },
                RegionDelta {
                    virtual_start: 0x3000,
                    virtual_end: 0x4000,
                    pathname: MMapPath::Anonymous,
                    change: RegionChange::Added,
                    pages: PageDelta::NotCompared,
                },
            ]
        );
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_removed_process_has_no_page_events() {
        let r1 = region("00001000-00003000 rw-p 00000000 00:00 0");
        let pages = vec![Some(vec![resident(10), resident(11)])];
        let p1 = Process::new(1, vec!["a".into()], vec![r1.clone()], pages);
        let p2 = Process::new(2, vec!["b".into()], vec![r1], vec![Some(vec![ABSENT, ABSENT])]);

        let a = snapshot(vec![p1, p2.clone()], Vec::new());
        let b = snapshot(vec![p2], Vec::new());

        let delta = diff(&a, &b);
        assert_eq!(delta.processes, BTreeMap::from([(1, ProcessDelta::Removed)]));
        assert_eq!(delta.removed().collect::<Vec<_>>(), vec![1]);
        assert_eq!(delta.added().count(), 0);
    }

    #[test]
    fn test_permission_change_and_replaced_region() {
        let before = vec![
            region("00001000-00002000 r--p 00000000 00:00 0"),
            region("00002000-00004000 rw-p 00000000 00:00 0"),
        ];
        let after = vec![
            region("00001000-00002000 rw-p 00000000 00:00 0"),
            region("00002000-00003000 rw-p 00000000 00:00 0"),
        ];
        let a = snapshot(
            vec![Process::new(1, vec![], before, vec![Some(vec![ABSENT]), None])],
            Vec::new(),
        );
        let b = snapshot(
            vec![Process::new(1, vec![], after, vec![Some(vec![ABSENT]), None])],
            Vec::new(),
        );

        let delta = diff(&a, &b);
        let Some(ProcessDelta::Changed(changes)) = delta.processes.get(&1) else {
            panic!("expected changes");
        };
        let kinds: Vec<&RegionChange> = changes.regions.iter().map(|r| &r.change).collect();
        assert!(matches!(
            kinds[0],
            RegionChange::PermissionChanged { before, after }
                if !before.contains(MMPermissions::WRITE) && after.contains(MMPermissions::WRITE)
        ));
        assert_eq!(kinds[1..], [&RegionChange::Removed, &RegionChange::Added]);
    }

    #[test]
    fn test_missing_pages_are_unknown() {
        let r1 = region("00001000-00003000 rw-p 00000000 00:00 0");
        let a = snapshot(
            vec![Process::new(1, vec![], vec![r1.clone()], vec![None])],
            Vec::new(),
        );
        let b = snapshot(
            vec![Process::new(1, vec![], vec![r1], vec![Some(vec![ABSENT, ABSENT])])],
            Vec::new(),
        );

        let delta = diff(&a, &b);
        assert_eq!(delta.processes.get(&1), Some(&ProcessDelta::Unknown));
        // unknown is not a change
        assert!(delta.is_empty());
        assert_eq!(delta.frames, FramesDelta::Unknown);

        let regions = diff_regions(a.process(1).unwrap(), b.process(1).unwrap(), 4096).regions;
        assert_eq!(regions[0].pages, PageDelta::Unknown);
    }

    #[test]
    fn test_self_diff_with_unknown_data_is_empty() {
        let r1 = region("00001000-00003000 rw-p 00000000 00:00 0");
        let r2 = region("00003000-00004000 rw-p 00000000 00:00 0");
        let process = Process::new(
            1,
            vec!["a".into()],
            vec![r1, r2],
            vec![Some(vec![PageState::Unknown, resident(10)]), None],
        );
        let a = snapshot(vec![process], Vec::new());

        assert_eq!(classify(&PageState::Unknown, &PageState::Unknown), None);
        let delta = diff(&a, &a);
        assert!(delta.processes.is_empty(), "{delta:?}");
        assert!(delta.is_empty());

        let changes = diff_regions(a.process(1).unwrap(), a.process(1).unwrap(), 4096);
        assert!(changes.regions.is_empty());
        assert_eq!(changes.unchanged_regions, 2);
    }

    #[test]
    fn test_segment_membership() {
        let mut s1 = SharedSegment::new(1, 10, 4096);
        s1.referencing_process_ids.extend([1, 2]);
        let s2 = SharedSegment::new(2, 20, 4096);
        let mut s1_after = s1.clone();
        s1_after.referencing_process_ids = BTreeSet::from([2, 3]);
        let s3 = SharedSegment::new(3, 30, 4096);

        let a = snapshot(Vec::new(), vec![s1, s2]);
        let b = snapshot(Vec::new(), vec![s1_after, s3]);

        let delta = diff(&a, &b);
        assert_eq!(
            delta.segments,
            vec![
                SegmentDelta {
                    key: 1,
                    id: 10,
                    change: SegmentChange::Membership {
                        gained: BTreeSet::from([3]),
                        lost: BTreeSet::from([1]),
                    }
                },
                SegmentDelta {
                    key: 2,
                    id: 20,
                    change: SegmentChange::Removed {
                        pids: BTreeSet::new()
                    }
                },
                SegmentDelta {
                    key: 3,
                    id: 30,
                    change: SegmentChange::Added {
                        pids: BTreeSet::new()
                    }
                },
            ]
        );
    }

    #[test]
    fn test_partial_process_is_unknown() {
        use crate::snapshot::PartialReason;

        let r1 = region("00001000-00002000 rw-p 00000000 00:00 0");
        let a = snapshot(
            vec![Process::partial(1, vec![], PartialReason::PermissionDenied)],
            Vec::new(),
        );
        let b = snapshot(
            vec![Process::new(1, vec![], vec![r1], vec![Some(vec![ABSENT])])],
            Vec::new(),
        );
        let delta = diff(&a, &b);
        assert_eq!(delta.processes.get(&1), Some(&ProcessDelta::Unknown));
        assert!(diff(&a, &a).processes.is_empty());
    }
}
