//! Persistent cache maintenance.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use texstream::cache::TexCache;

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Show the cache's disk footprint.
    Stats(CacheArgs),
    /// Drop every cache tier.
    Clear(CacheArgs),
}

#[derive(Args)]
pub struct CacheArgs {
    /// Cache root directory.
    #[arg(long)]
    dir: PathBuf,
}

pub async fn run(command: CacheCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        CacheCommand::Stats(args) => {
            let cache = TexCache::open(&args.dir)?;
            let bytes = cache.size_bytes();
            println!("Cache at {}", args.dir.display());
            println!("  {} bytes on disk ({:.1} MiB)", bytes, bytes as f64 / (1024.0 * 1024.0));
        }
        CacheCommand::Clear(args) => {
            let cache = TexCache::open(&args.dir)?;
            cache.clear().await?;
            println!("Cleared cache at {}", args.dir.display());
        }
    }
    Ok(())
}
