//! One capture pass over a procfs tree
//!
//! Global steps (census, segment registry) run once, then every process is
//! extracted independently on the rayon pool. Segment membership is resolved
//! afterwards, in pid order, from the regions each process reported.

use std::{collections::BTreeMap, path::PathBuf, time::SystemTime};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{
    census::run_census,
    maps::read_regions,
    pagemap::{read_residency, ResidencyOptions},
    shm::{AttachedSegments, SegmentRegistry},
    snapshot::{HostIdentity, PartialReason, Process, Snapshot},
    source::ProcRoot,
    Result,
};

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// procfs mount point, or an unpacked dump
    pub root: PathBuf,
    pub page_size: u64,
    /// shmat every segment before scanning processes
    pub attach_segments: bool,
    /// Read attached segments that are not in swap so their pages get mapped
    pub touch_segments: bool,
    /// Don't read pagemap entries of SysV regions, except for ourselves
    pub skip_shm_pagemap: bool,
    /// Capture the capturing process too
    pub include_self: bool,
    /// Size of the rayon pool, rayon's default if `None`
    pub threads: Option<usize>,
    pub progress: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            page_size: procfs::page_size(),
            attach_segments: false,
            touch_segments: true,
            skip_shm_pagemap: false,
            include_self: true,
            threads: None,
            progress: false,
        }
    }
}

/// Extract regions and page states of one process
///
/// Never fails: a process that can't be read is recorded as partial.
pub fn capture_process(
    root: &ProcRoot,
    pid: i32,
    page_size: u64,
    residency: ResidencyOptions,
) -> Process {
    let cmdline = match root.cmdline(pid) {
        Ok(cmdline) => cmdline,
        Err(e) => {
            debug!("Skipping pid {pid}: {e}");
            return Process::partial(pid, Vec::new(), PartialReason::from(&e));
        }
    };

    let regions = match read_regions(root, pid) {
        Ok(regions) => regions,
        Err(e) => {
            if e.is_vanished() {
                debug!("Skipping pid {pid}: {e}");
            } else {
                warn!("Skipping pid {pid}: {e}");
            }
            return Process::partial(pid, cmdline, PartialReason::from(&e));
        }
    };
    if regions.is_empty() {
        // kernel thread
        return Process::new(pid, cmdline, regions, Vec::new());
    }

    let pages = match read_residency(root, pid, &regions, page_size, residency) {
        Ok(residency) => residency.pages,
        Err(e) => {
            if e.is_vanished() {
                debug!("{e}");
            } else {
                warn!("Failed to dump pagemap for {pid}: {e}");
            }
            vec![None; regions.len()]
        }
    };

    Process::new(pid, cmdline, regions, pages)
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    match ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len}") {
        Ok(style) => pb.set_style(style),
        Err(e) => warn!("Bad progress bar template: {e}"),
    }
    pb.set_message("Scanning processes");
    pb
}

/// Capture a snapshot
///
/// Fails only if iomem or the process list can't be read, everything else
/// degrades to partial data.
pub fn capture(options: &CaptureOptions) -> Result<Snapshot> {
    let global_chrono = std::time::Instant::now();
    let root = ProcRoot::new(&options.root);
    let capture_time = SystemTime::now();
    let host = HostIdentity::read(&root, options.page_size);
    info!("Capturing {:?} on {}", root.path(), host.hostname);

    let census = run_census(&root, options.page_size)?;

    let mut segments = match SegmentRegistry::read(&root) {
        Ok(segments) => segments,
        Err(e) => {
            warn!("No SysV shared memory data: {e}");
            SegmentRegistry::default()
        }
    };
    info!("Found {} shm segment(s)", segments.len());

    // must stay alive until our own process has been scanned
    let attached = if options.attach_segments {
        Some(AttachedSegments::attach(
            &segments,
            options.page_size,
            options.touch_segments,
        ))
    } else {
        None
    };

    let my_pid = std::process::id() as i32;
    let mut pids = root.pids()?;
    if !options.include_self {
        pids.retain(|&pid| pid != my_pid);
    }

    let processes_chrono = std::time::Instant::now();
    let pb = progress_bar(pids.len(), options.progress);
    let scan = || -> Vec<Process> {
        pids.par_iter()
            .map(|&pid| {
                let residency = ResidencyOptions {
                    skip_shm: options.skip_shm_pagemap && pid != my_pid,
                };
                let process = capture_process(&root, pid, options.page_size, residency);
                pb.inc(1);
                process
            })
            .collect()
    };
    let scanned = match options.threads {
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?
            .install(scan),
        None => scan(),
    };
    pb.finish_and_clear();
    drop(attached);

    let processes: BTreeMap<i32, Process> = scanned.into_iter().map(|p| (p.pid, p)).collect();
    for process in processes.values() {
        segments.register_process(
            process.pid,
            &process.regions,
            &process.page_states,
            options.page_size,
        );
    }

    let partial = processes.values().filter(|p| p.is_partial()).count();
    info!(
        "Scanned {} processes ({} partial) in {:?}",
        processes.len(),
        partial,
        processes_chrono.elapsed()
    );

    let snapshot = Snapshot::new(
        host,
        capture_time,
        processes,
        census.iomem,
        census.frames,
        segments,
    );
    info!("Total duration: {:?}", global_chrono.elapsed());
    Ok(snapshot)
}
