//! h2bulkfree
//!
//! Runs bulkfree passes against JSON volume images

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hammer2_bulkfree::{
    Bulkfree, BulkfreeConfig, MemStore, PassReport, TreeShape, VolumeGeometry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

#[derive(Parser, Debug)]
#[command(name = "h2bulkfree")]
#[command(about = "Bulk free-space reclamation over HAMMER2-style volume images")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format a volume, fill it with a random tree and write the image
    Generate {
        /// Output image path
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Volume size in GB
        #[arg(short = 's', long, default_value = "4")]
        size_gb: u64,

        /// First allocatable offset in MB
        #[arg(long, default_value = "8")]
        allocator_beg_mb: u64,

        /// Number of PFS roots
        #[arg(long, default_value = "2")]
        pfs: usize,

        /// Inodes per PFS
        #[arg(long, default_value = "256")]
        inodes: usize,

        /// Share of extents linked a second time
        #[arg(long, default_value = "0.1")]
        shared: f64,

        /// Share of extents unlinked after being written
        #[arg(long, default_value = "0.2")]
        orphans: f64,

        /// RNG seed
        #[arg(long, default_value = "1")]
        seed: u64,
    },

    /// Run bulkfree passes over an image
    Run {
        /// Image path
        image: PathBuf,

        /// TOML configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Accumulator buffer in bytes (0 uses the configured default)
        #[arg(short = 'b', long, default_value = "0")]
        buffer: u64,

        /// Offset to resume from
        #[arg(short = 'r', long, default_value = "0")]
        resume: u64,

        /// Number of passes to run
        #[arg(short = 'n', long, default_value = "1")]
        passes: u32,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,

        /// Save the reconciled freemap back into the image
        #[arg(short = 'w', long)]
        write_back: bool,
    },

    /// Print a summary of an image's live freemap
    Stat {
        /// Image path
        image: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Generate {
            output,
            size_gb,
            allocator_beg_mb,
            pfs,
            inodes,
            shared,
            orphans,
            seed,
        } => {
            if !(0.0..=1.0).contains(&shared) || !(0.0..=1.0).contains(&orphans) {
                bail!("--shared and --orphans must be between 0 and 1");
            }
            let geometry = VolumeGeometry::new(allocator_beg_mb * MB, size_gb * GB);
            let store = MemStore::format(geometry).context("formatting volume")?;
            let shape = TreeShape {
                pfs_count: pfs,
                inodes_per_pfs: inodes,
                shared_ratio: shared,
                orphan_ratio: orphans,
                ..TreeShape::default()
            };
            let stats = store.populate(&shape, seed).context("populating volume")?;
            store
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(
                inodes = stats.inodes,
                extents = stats.extents,
                shared = stats.shared_links,
                orphaned = stats.orphaned,
                "Generated {:?}",
                output
            );
        }

        Command::Run {
            image,
            config,
            buffer,
            resume,
            passes,
            json,
            write_back,
        } => {
            let config = match config {
                Some(path) => BulkfreeConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => BulkfreeConfig::default(),
            };
            let store = Arc::new(
                MemStore::load(&image).with_context(|| format!("reading {}", image.display()))?,
            );
            let engine = Bulkfree::new(Arc::clone(&store), config)?;

            let mut offset = resume;
            let mut reports: Vec<PassReport> = Vec::new();
            for pass in 0..passes {
                info!("Bulkfree pass {} of {}", pass + 1, passes);
                let report = engine.run_one_pass(offset, buffer)?;
                offset = if report.complete() {
                    0
                } else {
                    report.next_resume_offset
                };
                let aborted = report.aborted;
                if !json {
                    println!("{}", report);
                }
                reports.push(report);
                if aborted {
                    break;
                }
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
            if write_back {
                store
                    .save(&image)
                    .with_context(|| format!("writing {}", image.display()))?;
            }
        }

        Command::Stat { image } => {
            let store =
                MemStore::load(&image).with_context(|| format!("reading {}", image.display()))?;
            let geometry = store.geometry();
            let summary = store.freemap_summary();
            println!("volume size        {}", geometry.total_size);
            println!("allocator begin    {:#x}", geometry.allocator_beg);
            println!("pfs roots          {}", store.pfs_roots().len());
            println!("segments           {}", summary.segments);
            println!("free blocks        {}", summary.free_blocks);
            println!("staged blocks      {}", summary.staged_blocks);
            println!("allocated blocks   {}", summary.allocated_blocks);
            println!("invalid blocks     {}", summary.invalid_blocks);
            println!("avail bytes        {}", summary.avail_bytes);
        }
    }

    Ok(())
}
