//! Human readable tables for snapshots and deltas

use colored::Colorize;
use tabled::Tabled;

use crate::{
    diff::{Delta, FramesDelta, PageChangeKind, PageDelta, ProcessDelta, RegionChange, SegmentChange},
    snapshot::Snapshot,
};

#[allow(non_snake_case)]
pub fn format_units_MiB(bytes: &u64) -> String {
    let format = humansize::FormatSizeOptions::from(humansize::BINARY)
        .fixed_at(Some(humansize::FixedAt::Mega));

    let s = humansize::format_size(*bytes, format);
    if *bytes == 0 {
        s.bright_black().to_string()
    } else {
        s
    }
}

fn format_count(count: &usize) -> String {
    match *count {
        0 => "0".bright_black().to_string(),
        n => n.to_string(),
    }
}

#[derive(Tabled)]
struct ProcessRow {
    pid: i32,
    name: String,
    regions: usize,
    #[tabled(display_with = "format_units_MiB")]
    virtual_size: u64,
    #[tabled(display_with = "format_units_MiB")]
    resident: u64,
    status: String,
}

#[derive(Tabled)]
struct SegmentRow {
    key: String,
    shmid: u64,
    #[tabled(display_with = "format_units_MiB")]
    size: u64,
    #[tabled(display_with = "format_units_MiB")]
    resident: u64,
    pids: String,
}

fn status(partial: Option<&crate::snapshot::PartialReason>) -> String {
    match partial {
        None => "ok".into(),
        Some(reason) => format!("{reason:?}").yellow().to_string(),
    }
}

/// Overview of a snapshot, processes sorted by resident memory
pub fn snapshot_summary(snapshot: &Snapshot) -> String {
    let page_size = snapshot.page_size();
    let host = snapshot.host();

    let mut rows: Vec<ProcessRow> = snapshot
        .processes()
        .values()
        .map(|p| ProcessRow {
            pid: p.pid,
            name: p.name().to_string(),
            regions: p.regions.len(),
            virtual_size: p.virtual_size(),
            resident: p.resident_pages() * page_size,
            status: status(p.partial.as_ref()),
        })
        .collect();
    rows.sort_by(|a, b| b.resident.cmp(&a.resident).then(a.pid.cmp(&b.pid)));

    let segments: Vec<SegmentRow> = snapshot
        .segments()
        .iter()
        .map(|s| SegmentRow {
            key: format!("{:#010x}", s.key as u32),
            shmid: s.id,
            size: s.size,
            resident: s.resident_pages() * page_size,
            pids: s.referencing_process_ids.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(","),
        })
        .collect();

    let mut out = format!(
        "{} ({}), page size {}\n",
        host.hostname.bold(),
        host.kernel_release,
        page_size
    );
    out += &format!(
        "{} processes, {} partial, {} resident, {} unique frames\n",
        snapshot.processes().len(),
        snapshot.partial_processes(),
        format_units_MiB(&(snapshot.aggregate_resident_pages() * page_size)),
        snapshot.unique_frames().len()
    );
    match snapshot.frames() {
        Some(frames) => {
            let summary = frames.summary();
            out += &format!(
                "RAM frames: {} ({} referenced, {} huge, {} anon)\n",
                summary.frames, summary.referenced, summary.huge, summary.anon
            );
        }
        None => out += &format!("RAM frames: {}\n", "unavailable".yellow()),
    }

    let mut table = tabled::Table::new(&rows);
    table.with(tabled::settings::Style::sharp());
    out += &format!("{table}\n");

    if !segments.is_empty() {
        let mut table = tabled::Table::new(&segments);
        table.with(tabled::settings::Style::sharp());
        out += &format!("{table}\n");
    }
    out
}

#[derive(Tabled)]
struct ProcessDeltaRow {
    pid: i32,
    change: String,
    #[tabled(display_with = "format_count")]
    regions_added: usize,
    #[tabled(display_with = "format_count")]
    regions_removed: usize,
    #[tabled(display_with = "format_count")]
    regions_modified: usize,
    #[tabled(display_with = "format_count")]
    became_resident: usize,
    #[tabled(display_with = "format_count")]
    evicted: usize,
    #[tabled(display_with = "format_count")]
    frame_changed: usize,
    #[tabled(display_with = "format_count")]
    unknown_pages: usize,
}

impl ProcessDeltaRow {
    fn new(pid: i32, delta: &ProcessDelta) -> Self {
        let mut row = Self {
            pid,
            change: String::new(),
            regions_added: 0,
            regions_removed: 0,
            regions_modified: 0,
            became_resident: 0,
            evicted: 0,
            frame_changed: 0,
            unknown_pages: 0,
        };
        let changes = match delta {
            ProcessDelta::Added => {
                row.change = "added".green().to_string();
                return row;
            }
            ProcessDelta::Removed => {
                row.change = "removed".red().to_string();
                return row;
            }
            ProcessDelta::Unknown => {
                row.change = "unknown".yellow().to_string();
                return row;
            }
            ProcessDelta::Changed(changes) => changes,
        };

        row.change = if changes.cmdline_changed {
            "cmdline".to_string()
        } else {
            "changed".to_string()
        };
        for region in &changes.regions {
            match region.change {
                RegionChange::Added => row.regions_added += 1,
                RegionChange::Removed => row.regions_removed += 1,
                RegionChange::PermissionChanged { .. } => row.regions_modified += 1,
                RegionChange::Unchanged => (),
            }
            if let PageDelta::Compared(pages) = &region.pages {
                for page in pages {
                    match page.kind {
                        PageChangeKind::BecameResident { .. } => row.became_resident += 1,
                        PageChangeKind::Evicted { .. } => row.evicted += 1,
                        PageChangeKind::FrameChanged { .. } => row.frame_changed += 1,
                        PageChangeKind::Unknown => row.unknown_pages += 1,
                    }
                }
            }
        }
        row
    }
}

/// Per process counters of a delta, followed by segment and frame changes
pub fn delta_summary(delta: &Delta) -> String {
    if delta.is_empty() {
        return format!("{}\n", "No changes".bold());
    }

    let rows: Vec<ProcessDeltaRow> = delta
        .processes
        .iter()
        .map(|(&pid, d)| ProcessDeltaRow::new(pid, d))
        .collect();

    let mut out = String::new();
    if !rows.is_empty() {
        let mut table = tabled::Table::new(&rows);
        table.with(tabled::settings::Style::sharp());
        out += &format!("{table}\n");
    }

    for segment in &delta.segments {
        let change = match &segment.change {
            SegmentChange::Added { pids } => format!("{} {pids:?}", "added".green()),
            SegmentChange::Removed { pids } => format!("{} {pids:?}", "removed".red()),
            SegmentChange::Membership { gained, lost } => {
                format!("attached by {gained:?}, detached by {lost:?}")
            }
        };
        out += &format!("shm key {:#010x} shmid {}: {change}\n", segment.key as u32, segment.id);
    }

    match delta.frames {
        FramesDelta::Unknown => out += &format!("RAM frames: {}\n", "not compared".yellow()),
        FramesDelta::Compared {
            changed,
            only_in_a,
            only_in_b,
        } => {
            out += &format!(
                "RAM frames: {changed} changed, {only_in_a} only before, {only_in_b} only after\n"
            )
        }
    }
    out
}
