//! Print the bundles a document resolves to.

use std::fs;
use std::path::PathBuf;

use clap::Args;

use texstream::bundle::{BundleDeps, BundleRegistry, PackageDeps, PackageMap};
use texstream::resolve::{detect_engine, extract_declared, Resolver};
use texstream::Engine;

#[derive(Args)]
pub struct ResolveArgs {
    /// LaTeX source file.
    file: PathBuf,

    /// Directory holding `registry.json`, `package-map.json`, and
    /// `bundle-deps.json` (and optionally `package-deps.json`).
    #[arg(long)]
    manifest_dir: PathBuf,

    /// Engine to resolve for; detected from the source when omitted.
    #[arg(long)]
    engine: Option<Engine>,
}

pub fn run(args: ResolveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let source = fs::read_to_string(&args.file)?;
    let engine = args.engine.unwrap_or_else(|| detect_engine(&source));

    let registry =
        BundleRegistry::from_json(&fs::read(args.manifest_dir.join("registry.json"))?)?;
    let package_map =
        PackageMap::from_json(&fs::read(args.manifest_dir.join("package-map.json"))?)?;
    let bundle_deps =
        BundleDeps::from_json(&fs::read(args.manifest_dir.join("bundle-deps.json"))?)?;
    let package_deps = fs::read(args.manifest_dir.join("package-deps.json"))
        .ok()
        .and_then(|raw| PackageDeps::from_json(&raw).ok());

    let resolver = Resolver::new(registry, package_map, bundle_deps, package_deps);
    let declared = extract_declared(&source);
    let bundles = resolver.resolve(&source, engine);

    println!("Engine:   {engine}");
    println!("Declared: {}", declared.join(", "));
    println!("Bundles:");
    for bundle in &bundles {
        println!("  {bundle}");
    }
    Ok(())
}
