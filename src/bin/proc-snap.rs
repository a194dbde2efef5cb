// Capture and compare process memory snapshots
// - Should run as root, otherwise frame numbers are zeroed and most processes are partial
// - `--attach-shm` maps every SysV segment read only into this process

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{debug, info};

use proc_snap::{capture, diff, display, CaptureOptions, Snapshot};

#[derive(Parser, Debug)]
#[command(author, version, about = "Point in time snapshots of process memory", long_about = None)]
struct Cli {
    #[arg(short, long, global = true, help = "Debug logging")]
    verbose: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture a snapshot into a new directory
    Capture {
        dir: PathBuf,

        #[arg(long, default_value = "/proc")]
        root: PathBuf,

        #[arg(long, help = "Attach every SysV segment so its pages show up in our pagemap")]
        attach_shm: bool,

        #[arg(long, help = "Don't read SysV regions of other processes")]
        skip_shm_pagemap: bool,

        #[arg(long, help = "Don't read attached segments that are partly in swap")]
        no_touch: bool,

        #[arg(long, help = "Don't capture this process")]
        exclude_self: bool,

        #[arg(short, long)]
        threads: Option<usize>,

        #[arg(short, long)]
        progress: bool,
    },
    /// Print a stored snapshot
    Summary { dir: PathBuf },
    /// Compare two stored snapshots, `a` being the earlier one
    Diff {
        a: PathBuf,
        b: PathBuf,

        #[arg(long, help = "Print the full delta as JSON")]
        json: bool,
    },
}

fn load(dir: &Path) -> anyhow::Result<Snapshot> {
    Snapshot::load(dir).with_context(|| format!("Can't load snapshot {dir:?}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    let global_chrono = std::time::Instant::now();

    match cli.commands {
        Commands::Capture {
            dir,
            root,
            attach_shm,
            skip_shm_pagemap,
            no_touch,
            exclude_self,
            threads,
            progress,
        } => {
            let options = CaptureOptions {
                root,
                attach_segments: attach_shm,
                touch_segments: !no_touch,
                skip_shm_pagemap,
                include_self: !exclude_self,
                threads,
                progress,
                ..Default::default()
            };
            debug!("{options:?}");

            let snapshot = capture(&options)
                .with_context(|| format!("Capture of {:?} failed", options.root))?;
            snapshot
                .save(&dir)
                .with_context(|| format!("Can't save snapshot to {dir:?}"))?;
            println!(
                "Captured {} processes ({} partial) into {dir:?}",
                snapshot.processes().len(),
                snapshot.partial_processes()
            );
        }
        Commands::Summary { dir } => {
            let snapshot = load(&dir)?;
            print!("{}", display::snapshot_summary(&snapshot));
        }
        Commands::Diff { a, b, json } => {
            let before = load(&a)?;
            let after = load(&b)?;
            let chrono = std::time::Instant::now();
            let delta = diff(&before, &after);
            info!("Diff: {:?}", chrono.elapsed());

            if json {
                println!("{}", serde_json::to_string_pretty(&delta)?);
            } else {
                print!("{}", display::delta_summary(&delta));
            }
        }
    }

    debug!("Total duration: {:?}", global_chrono.elapsed());
    Ok(())
}
