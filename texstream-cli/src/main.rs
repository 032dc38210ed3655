//! texstream CLI — resource-fabric tooling.
//!
//! Local tooling around the texstream library: packing and unpacking
//! bundles, resolving a document's required bundle set, and maintaining
//! the persistent cache. Compilation itself needs an embedder-supplied
//! engine runtime and lives behind the library API.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "texstream")]
#[command(about = "Bundle, resolve, and cache tooling for texstream", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack a directory of TeX files into a bundle, or unpack one.
    #[command(subcommand)]
    Bundle(commands::bundle::BundleCommand),

    /// Show which bundles a document needs.
    Resolve(commands::resolve::ResolveArgs),

    /// Inspect or clear the persistent cache.
    #[command(subcommand)]
    Cache(commands::cache::CacheCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Bundle(cmd) => commands::bundle::run(cmd),
        Command::Resolve(args) => commands::resolve::run(args),
        Command::Cache(cmd) => commands::cache::run(cmd).await,
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
