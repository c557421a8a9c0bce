//! Elohim Blockservice CLI
//!
//! Stores and reads blocks through the pack CDN, in offline mode (no peer
//! exchange).
//!
//! ## Usage
//!
//! ```bash
//! # Store files as raw blocks in the owner's current pack
//! elohim-blockservice --owner u1 put a.bin b.bin
//!
//! # Read a block back
//! elohim-blockservice get bafkrei... --out a.bin
//!
//! # Evict a block from the local cache
//! elohim-blockservice rm bafkrei...
//! ```
//!
//! Endpoints come from the config file or `BLOCKSERVICE_*` variables.

use anyhow::Context;
use cid::Cid;
use clap::{Parser, Subcommand};
use elohim_blockservice::{
    Block, BlockService, CallContext, Config, FsBlockstore, HttpRemoteStore, HttpUsageReporter,
    SledIndex,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-blockservice")]
#[command(about = "Content-addressed blocks on a pack CDN")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Owner scope receiving writes
    #[arg(long, env = "BLOCKSERVICE_OWNER")]
    owner: Option<String>,

    /// Write fetched blocks back into the local stores
    #[arg(long)]
    cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store files as raw blocks and print their CIDs
    Put {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Fetch a block
    Get {
        cid: String,
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remove a block from the local blockstore
    Rm { cid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("elohim_blockservice=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    config.apply_env();
    config.validate()?;

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let index = Arc::new(SledIndex::open(config.index_path())?);
    let remote = Arc::new(HttpRemoteStore::new(
        config.uploader_url.clone(),
        config.request_timeout(),
    )?);
    let blockstore = Arc::new(FsBlockstore::new(config.blocks_dir()).await?);

    let mut service = BlockService::new(blockstore, None, index.clone(), remote)
        .with_config(config.service_config());
    if config.dedicated_gateway {
        let reporter = HttpUsageReporter::new(
            &config.pinning_service_url,
            config.api_key.clone(),
            config.request_timeout(),
        )?;
        service = service.with_usage_reporter(Arc::new(reporter));
    }

    let mut ctx = CallContext::new().with_cache(args.cache);
    if let Some(owner) = args.owner {
        ctx = ctx.with_owner(owner);
    }

    match args.command {
        Command::Put { files } => {
            let mut blocks = Vec::with_capacity(files.len());
            for path in &files {
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                blocks.push(Block::new(data));
            }
            let cids: Vec<Cid> = blocks.iter().map(|b| *b.cid()).collect();

            if blocks.len() == 1 {
                service.add_block(blocks.remove(0), &ctx).await?;
            } else {
                service.add_blocks(blocks, &ctx).await?;
            }

            for (path, cid) in files.iter().zip(&cids) {
                println!("{}\t{}", cid, path.display());
            }
        }
        Command::Get { cid, out } => {
            let cid = parse_cid(&cid)?;
            let block = service.get_block(&cid, &ctx).await?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, block.data()).await?;
                    info!(cid = %cid, path = %path.display(), bytes = block.len(), "Wrote block");
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(block.data()).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Rm { cid } => {
            let cid = parse_cid(&cid)?;
            service.delete_block(&cid).await?;
            info!(cid = %cid, "Removed block from local cache");
        }
    }

    service.close().await?;
    index.flush().await?;
    Ok(())
}

fn parse_cid(s: &str) -> anyhow::Result<Cid> {
    Cid::try_from(s).with_context(|| format!("invalid CID: {}", s))
}
