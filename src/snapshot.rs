//! Snapshot Model: one immutable point-in-time record
//!
//! A snapshot is built once, by [`crate::capture::capture`] or by
//! [`Snapshot::load`], and only read afterwards. On disk it is a directory:
//!
//! ```text
//! metadata.json        host, capture time, iomem, segments, pids
//! frames.json          frame table, absent when the census failed
//! processes/<pid>.json one process each
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    fs::File,
    hash::BuildHasherDefault,
    io::{BufReader, BufWriter, Write},
    path::Path,
    time::SystemTime,
};

use log::{debug, info};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::{
    census::{FrameSummary, FrameTable, PhysicalRange},
    maps::Region,
    pagemap::PageState,
    shm::{SegmentRegistry, SharedSegment},
    source::ProcRoot,
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub kernel_release: String,
    pub page_size: u64,
}

impl HostIdentity {
    pub fn read(root: &ProcRoot, page_size: u64) -> Self {
        Self {
            hostname: root
                .read_value("sys/kernel/hostname")
                .unwrap_or_else(|| "unknown".into()),
            kernel_release: root
                .read_value("sys/kernel/osrelease")
                .unwrap_or_else(|| "unknown".into()),
            page_size,
        }
    }
}

/// Why a process has no region data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartialReason {
    /// Exited between listing and reading
    Vanished,
    PermissionDenied,
    /// Readable but empty, eg. kernel threads
    NoRegions,
    Unreadable(String),
}

impl From<&Error> for PartialReason {
    fn from(e: &Error) -> Self {
        match e {
            e if e.is_vanished() => PartialReason::Vanished,
            Error::PermissionDenied { .. } => PartialReason::PermissionDenied,
            e => PartialReason::Unreadable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: i32,
    pub cmdline: Vec<String>,
    /// Sorted by start address, non overlapping
    pub regions: Vec<Region>,
    /// Region start address -> one state per page of the region.
    /// A region missing here had no readable pagemap.
    pub page_states: BTreeMap<u64, Vec<PageState>>,
    pub partial: Option<PartialReason>,
}

impl Process {
    /// `pages[i]` holds the page states of `regions[i]`, if they could be read
    pub fn new(
        pid: i32,
        cmdline: Vec<String>,
        regions: Vec<Region>,
        pages: Vec<Option<Vec<PageState>>>,
    ) -> Self {
        let page_states = regions
            .iter()
            .zip(pages)
            .filter_map(|(region, pages)| Some((region.virtual_start, pages?)))
            .collect();
        let partial = if regions.is_empty() {
            Some(PartialReason::NoRegions)
        } else {
            None
        };

        Self {
            pid,
            cmdline,
            regions,
            page_states,
            partial,
        }
    }

    pub fn partial(pid: i32, cmdline: Vec<String>, reason: PartialReason) -> Self {
        Self {
            pid,
            cmdline,
            regions: Vec::new(),
            page_states: BTreeMap::new(),
            partial: Some(reason),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn pages(&self, region: &Region) -> Option<&[PageState]> {
        self.page_states
            .get(&region.virtual_start)
            .map(|pages| pages.as_slice())
    }

    /// Resident pages of this process, not counting SysV segments
    ///
    /// Segment pages belong to the segment, see
    /// [`Snapshot::aggregate_resident_pages`].
    pub fn resident_pages(&self) -> u64 {
        self.regions
            .iter()
            .filter(|region| region.sysv_segment().is_none())
            .filter_map(|region| self.pages(region))
            .flatten()
            .filter(|page| page.present())
            .count() as u64
    }

    pub fn virtual_size(&self) -> u64 {
        self.regions.iter().map(|region| region.size()).sum()
    }

    pub fn name(&self) -> &str {
        self.cmdline.first().map(|s| s.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    host: HostIdentity,
    capture_time: SystemTime,
    processes: BTreeMap<i32, Process>,
    iomem: Vec<PhysicalRange>,
    frames: Option<FrameTable>,
    segments: SegmentRegistry,
}

impl Snapshot {
    /// Assemble a snapshot
    ///
    /// Resident pages whose frame number is not in `frames` get flagged
    /// `frame_unknown`, all of them if there is no frame data.
    pub fn new(
        host: HostIdentity,
        capture_time: SystemTime,
        processes: BTreeMap<i32, Process>,
        iomem: Vec<PhysicalRange>,
        frames: Option<FrameTable>,
        segments: SegmentRegistry,
    ) -> Self {
        let mut snapshot = Self {
            host,
            capture_time,
            processes,
            iomem,
            frames,
            segments,
        };
        snapshot.flag_unknown_frames();
        snapshot
    }

    fn flag_unknown_frames(&mut self) {
        let frames = self.frames.as_ref();
        let flag = |page: &mut PageState| {
            if let Some(frame) = page.frame_number() {
                page.set_frame_unknown(!frames.is_some_and(|f| f.contains(frame)));
            }
        };

        for process in self.processes.values_mut() {
            process.page_states.values_mut().flatten().for_each(&flag);
        }
        self.segments.for_each_page_mut(&flag);
    }

    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    pub fn capture_time(&self) -> SystemTime {
        self.capture_time
    }

    pub fn page_size(&self) -> u64 {
        self.host.page_size
    }

    pub fn processes(&self) -> &BTreeMap<i32, Process> {
        &self.processes
    }

    pub fn process(&self, pid: i32) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn iomem(&self) -> &[PhysicalRange] {
        &self.iomem
    }

    pub fn frames(&self) -> Option<&FrameTable> {
        self.frames.as_ref()
    }

    pub fn segments(&self) -> &SegmentRegistry {
        &self.segments
    }

    pub fn segment(&self, key: i32, id: u64) -> Option<&SharedSegment> {
        self.segments.get(key, id)
    }

    /// Resident pages over all processes, shared segments counted once
    pub fn aggregate_resident_pages(&self) -> u64 {
        let private: u64 = self.processes.values().map(|p| p.resident_pages()).sum();
        let shared: u64 = self.segments.iter().map(|s| s.resident_pages()).sum();
        private + shared
    }

    /// Distinct frame numbers mapped by any process or segment
    pub fn unique_frames(&self) -> HashSet<u64, BuildHasherDefault<FxHasher>> {
        let mut frames: HashSet<u64, BuildHasherDefault<FxHasher>> = HashSet::default();
        for process in self.processes.values() {
            frames.extend(
                process
                    .page_states
                    .values()
                    .flatten()
                    .filter_map(|page| page.frame_number()),
            );
        }
        for segment in self.segments.iter() {
            frames.extend(segment.pages.iter().filter_map(|page| page.frame_number()));
        }
        frames
    }

    pub fn partial_processes(&self) -> usize {
        self.processes.values().filter(|p| p.is_partial()).count()
    }
}

#[derive(Serialize, Deserialize)]
struct Metadata {
    host: HostIdentity,
    capture_time: SystemTime,
    iomem: Vec<PhysicalRange>,
    segments: SegmentRegistry,
    pids: Vec<i32>,
    frame_summary: Option<FrameSummary>,
}

const METADATA: &str = "metadata.json";
const FRAMES: &str = "frames.json";
const PROCESSES: &str = "processes";

/// Serialize `value` to a new file at `path`
fn write_json<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    let mut writer = File::create(path)
        .map(BufWriter::new)
        .map_err(|e| Error::from_io(path.to_owned(), e))?;
    if pretty {
        serde_json::to_writer_pretty(&mut writer, value)?;
    } else {
        serde_json::to_writer(&mut writer, value)?;
    }
    writer.flush().map_err(|e| Error::from_io(path.to_owned(), e))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::from_io(path.to_owned(), e))
}

impl Snapshot {
    /// Write the snapshot to `dir`, which must not exist or be empty
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let chrono = std::time::Instant::now();

        if dir.exists() {
            let mut entries = std::fs::read_dir(dir).map_err(|e| Error::from_io(dir.to_owned(), e))?;
            if entries.next().is_some() {
                return Err(Error::InvalidStore {
                    path: dir.to_owned(),
                    reason: "directory is not empty".into(),
                });
            }
        }
        let processes_dir = dir.join(PROCESSES);
        std::fs::create_dir_all(&processes_dir)
            .map_err(|e| Error::from_io(processes_dir.clone(), e))?;

        let metadata = Metadata {
            host: self.host.clone(),
            capture_time: self.capture_time,
            iomem: self.iomem.clone(),
            segments: self.segments.clone(),
            pids: self.processes.keys().copied().collect(),
            frame_summary: self.frames.as_ref().map(|f| f.summary()),
        };
        write_json(&dir.join(METADATA), &metadata, true)?;

        if let Some(frames) = &self.frames {
            write_json(&dir.join(FRAMES), frames, false)?;
        }

        for (pid, process) in &self.processes {
            write_json(&processes_dir.join(format!("{pid}.json")), process, false)?;
        }

        info!(
            "Saved {} processes to {:?} in {:?}",
            self.processes.len(),
            dir,
            chrono.elapsed()
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let chrono = std::time::Instant::now();

        let metadata: Metadata = serde_json::from_reader(open(&dir.join(METADATA))?)?;

        let frames_path = dir.join(FRAMES);
        let frames: Option<FrameTable> = match metadata.frame_summary {
            Some(_) => Some(serde_json::from_reader(open(&frames_path)?)?),
            None => None,
        };
        if let Some(frames) = &frames {
            frames.validate().map_err(|reason| Error::InvalidStore {
                path: frames_path.clone(),
                reason,
            })?;
        }

        let mut processes = BTreeMap::new();
        for pid in metadata.pids {
            let path = dir.join(PROCESSES).join(format!("{pid}.json"));
            let process: Process = serde_json::from_reader(open(&path)?)?;
            if process.pid != pid {
                return Err(Error::InvalidStore {
                    path,
                    reason: format!("contains pid {}", process.pid),
                });
            }
            processes.insert(pid, process);
        }
        debug!("Loaded {:?} in {:?}", dir, chrono.elapsed());

        Ok(Self::new(
            metadata.host,
            metadata.capture_time,
            processes,
            metadata.iomem,
            frames,
            metadata.segments,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        census::RamFrames,
        maps::parse_region,
        shm::SharedSegment,
    };
    use pretty_assertions::assert_eq;

    fn resident(frame: u64) -> PageState {
        PageState::Resident {
            frame: Some(frame),
            file_mapped: false,
            soft_dirty: false,
            exclusive: true,
            frame_unknown: false,
        }
    }

    fn host() -> HostIdentity {
        HostIdentity {
            hostname: "test".into(),
            kernel_release: "6.1.0".into(),
            page_size: 4096,
        }
    }

    fn frames() -> FrameTable {
        FrameTable::from_ranges(vec![RamFrames {
            first_frame: 10,
            counts: vec![1; 10],
            flags: vec![0; 10],
        }])
    }

    #[test]
    fn test_process_new() {
        let regions = vec![
            parse_region("00001000-00003000 rw-p 00000000 00:00 0").unwrap(),
            parse_region("00003000-00004000 rw-p 00000000 00:00 0 [heap]").unwrap(),
        ];
        let process = Process::new(
            1,
            vec!["init".into()],
            regions,
            vec![Some(vec![resident(10), resident(11)]), None],
        );

        assert!(!process.is_partial());
        assert_eq!(process.page_states.len(), 1);
        assert_eq!(process.regions[1].pathname, procfs::process::MMapPath::Heap);
        assert_eq!(process.pages(&process.regions[1]), None);
        assert_eq!(process.resident_pages(), 2);
        assert_eq!(process.virtual_size(), 0x3000);
        assert_eq!(process.name(), "init");

        let kthread = Process::new(2, Vec::new(), Vec::new(), Vec::new());
        assert_eq!(kthread.partial, Some(PartialReason::NoRegions));
    }

    #[test]
    fn test_frame_unknown_flag() {
        let region = parse_region("00001000-00003000 rw-p 00000000 00:00 0").unwrap();
        let process = Process::new(
            1,
            vec!["a".into()],
            vec![region.clone()],
            vec![Some(vec![resident(12), resident(500)])],
        );
        let processes = BTreeMap::from([(1, process)]);

        let snapshot = Snapshot::new(
            host(),
            SystemTime::UNIX_EPOCH,
            processes.clone(),
            Vec::new(),
            Some(frames()),
            SegmentRegistry::default(),
        );
        let pages = snapshot.process(1).unwrap().pages(&region).unwrap();
        assert!(matches!(pages[0], PageState::Resident { frame_unknown: false, .. }));
        assert!(matches!(pages[1], PageState::Resident { frame_unknown: true, .. }));
        // still reported with its number, never coerced
        assert_eq!(pages[1].frame_number(), Some(500));

        let snapshot = Snapshot::new(
            host(),
            SystemTime::UNIX_EPOCH,
            processes,
            Vec::new(),
            None,
            SegmentRegistry::default(),
        );
        let pages = snapshot.process(1).unwrap().pages(&region).unwrap();
        assert!(pages
            .iter()
            .all(|p| matches!(p, PageState::Resident { frame_unknown: true, .. })));
    }

    #[test]
    fn test_save_load() {
        let region = parse_region("00001000-00003000 rw-p 00000000 00:00 0").unwrap();
        let mut segment = SharedSegment::new(5678, 32769, 8192);
        segment.referencing_process_ids.insert(1);
        segment.pages = vec![resident(15), PageState::NotPresent { file_mapped: true }];

        let processes = BTreeMap::from([
            (
                1,
                Process::new(
                    1,
                    vec!["a".into(), "--flag".into()],
                    vec![region],
                    vec![Some(vec![resident(12), PageState::Unknown])],
                ),
            ),
            (
                2,
                Process::partial(2, Vec::new(), PartialReason::PermissionDenied),
            ),
        ]);
        let snapshot = Snapshot::new(
            host(),
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000),
            processes,
            crate::census::parse_iomem("00001000-0009fbff : System RAM\n"),
            Some(frames()),
            SegmentRegistry::new(vec![segment]),
        );

        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("snap");
        snapshot.save(&store).unwrap();
        assert!(store.join("processes/2.json").exists());

        let loaded = Snapshot::load(&store).unwrap();
        assert_eq!(loaded, snapshot);

        // refuse to overwrite
        assert!(matches!(
            snapshot.save(&store),
            Err(Error::InvalidStore { .. })
        ));
    }

    #[test]
    fn test_load_rejects_inconsistent_frames() {
        let snapshot = Snapshot::new(
            host(),
            SystemTime::UNIX_EPOCH,
            BTreeMap::new(),
            Vec::new(),
            Some(frames()),
            SegmentRegistry::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        snapshot.save(dir.path()).unwrap();

        // one flag for ten counts
        let bad = FrameTable::from_ranges(vec![RamFrames {
            first_frame: 10,
            counts: vec![1; 10],
            flags: vec![0],
        }]);
        std::fs::write(dir.path().join(FRAMES), serde_json::to_vec(&bad).unwrap()).unwrap();

        assert!(matches!(
            Snapshot::load(dir.path()),
            Err(Error::InvalidStore { .. })
        ));
    }

    #[test]
    fn test_saved_files_are_complete() {
        let region = parse_region("00001000-00003000 rw-p 00000000 00:00 0").unwrap();
        let pages = vec![Some(vec![resident(12); 2])];
        let process = Process::new(1, vec!["a".into()], vec![region], pages);
        let snapshot = Snapshot::new(
            host(),
            SystemTime::UNIX_EPOCH,
            BTreeMap::from([(1, process.clone())]),
            Vec::new(),
            Some(frames()),
            SegmentRegistry::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        snapshot.save(dir.path()).unwrap();

        // readable right away, without going through load
        let raw = std::fs::read(dir.path().join("processes/1.json")).unwrap();
        let read: Process = serde_json::from_slice(&raw).unwrap();
        assert_eq!(read.regions, process.regions);
        let raw = std::fs::read(dir.path().join(FRAMES)).unwrap();
        let read: FrameTable = serde_json::from_slice(&raw).unwrap();
        assert_eq!(read, frames());
    }

    #[test]
    fn test_save_load_without_frames() {
        let snapshot = Snapshot::new(
            host(),
            SystemTime::UNIX_EPOCH,
            BTreeMap::new(),
            Vec::new(),
            None,
            SegmentRegistry::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        snapshot.save(dir.path()).unwrap();
        assert!(!dir.path().join(FRAMES).exists());
        assert_eq!(Snapshot::load(dir.path()).unwrap(), snapshot);
    }
}
