//! vea-tool
//!
//! Inspect and format allocator pool images

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use vea_rs::{Pool, SpaceInfo, VeaConfig};

#[derive(Parser, Debug)]
#[command(name = "vea-tool")]
#[command(about = "Format and inspect extent allocator pool images")]
struct Args {
    /// Path to the pool image
    #[arg(short = 'p', long)]
    pool: PathBuf,

    /// Allocator configuration (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format the pool, creating the image if needed
    Format {
        /// Capacity in blocks, header blocks included
        #[arg(short = 'b', long)]
        blocks: u64,

        /// Reformat a pool that already holds a space
        #[arg(long)]
        force: bool,
    },

    /// List free extents
    Dump {
        /// Dump the in-memory indices rebuilt from the image
        #[arg(long)]
        transient: bool,
    },

    /// Print attributes and statistics
    Query {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check metadata consistency, or whether a range is allocated
    Verify {
        #[arg(long, requires = "count")]
        offset: Option<u64>,

        #[arg(long, requires = "offset")]
        count: Option<u32>,
    },
}

fn load_config(args: &Args) -> Result<VeaConfig> {
    match &args.config {
        Some(path) => VeaConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(VeaConfig::default()),
    }
}

fn load_space(args: &Args, config: VeaConfig) -> Result<SpaceInfo> {
    let pool = Pool::open(&args.pool)
        .with_context(|| format!("opening pool image {}", args.pool.display()))?;
    Ok(SpaceInfo::load(pool, config)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match &args.command {
        Command::Format { blocks, force } => {
            let mut pool = if args.pool.exists() {
                Pool::open(&args.pool)?
            } else {
                Pool::create(&args.pool)?
            };
            SpaceInfo::format(&mut pool, &config, *blocks, *force)
                .with_context(|| format!("formatting {}", args.pool.display()))?;
            info!("Formatted {} with {} blocks", args.pool.display(), blocks);
        }

        Command::Dump { transient } => {
            let space = load_space(&args, config)?;
            for ext in space.dump(*transient)? {
                println!("{:>12} {:>10}", ext.offset, ext.block_count);
            }
        }

        Command::Query { json } => {
            let space = load_space(&args, config)?;
            let (attrs, stats) = space.query()?;
            if *json {
                let doc = serde_json::json!({ "attributes": attrs, "stats": stats });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("block size:       {}", attrs.block_size);
                println!("header blocks:    {}", attrs.header_blocks);
                println!("large threshold:  {}", attrs.large_threshold);
                println!("total blocks:     {}", attrs.total_blocks);
                println!("free (persistent): {}", attrs.free_persistent);
                println!("free (transient):  {}", attrs.free_transient);
                println!("large extents:    {}", stats.free_large);
                println!("small extents:    {}", stats.free_small);
            }
        }

        Command::Verify { offset, count } => {
            let space = load_space(&args, config)?;
            space.check_integrity()?;

            if let (Some(offset), Some(count)) = (offset, count) {
                if !space.verify_alloc(false, *offset, *count)? {
                    bail!("range {}+{} is not fully allocated", offset, count);
                }
                println!("range {}+{} is allocated", offset, count);
            } else {
                println!("ok");
            }
        }
    }

    Ok(())
}
