//! Bundle packing and unpacking.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum BundleCommand {
    /// Pack a directory tree into `<id>.data.gz`, `<id>.raw`, and
    /// `<id>.meta.json`.
    Pack(PackArgs),
    /// Unpack a bundle body and manifest back into files.
    Unpack(UnpackArgs),
}

#[derive(Args)]
pub struct PackArgs {
    /// Bundle ID (output file stem).
    #[arg(long)]
    id: String,

    /// Directory whose contents become the bundle, rooted at the engine
    /// namespace (e.g. containing `texlive/texmf-dist/...`).
    #[arg(long)]
    dir: PathBuf,

    /// Output directory.
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[derive(Args)]
pub struct UnpackArgs {
    /// Bundle body (`<id>.raw` or `<id>.data`).
    #[arg(long)]
    data: PathBuf,

    /// Bundle manifest (`<id>.meta.json`).
    #[arg(long)]
    manifest: PathBuf,

    /// Output directory.
    #[arg(long)]
    out: PathBuf,
}

pub fn run(command: BundleCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        BundleCommand::Pack(args) => pack(args),
        BundleCommand::Unpack(args) => unpack(args),
    }
}

fn pack(args: PackArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut files = Vec::new();
    collect_files(&args.dir, &args.dir, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));
    println!("Packing {} files from {}", files.len(), args.dir.display());

    let (body, manifest) = texstream::bundle::pack(&args.id, &files);
    fs::create_dir_all(&args.out)?;

    let raw_path = args.out.join(format!("{}.raw", args.id));
    fs::write(&raw_path, &body)?;

    let gz_path = args.out.join(format!("{}.data.gz", args.id));
    let mut encoder =
        flate2::write::GzEncoder::new(fs::File::create(&gz_path)?, flate2::Compression::default());
    encoder.write_all(&body)?;
    encoder.finish()?;

    let meta_path = args.out.join(format!("{}.meta.json", args.id));
    fs::write(&meta_path, serde_json::to_vec_pretty(&manifest)?)?;

    println!(
        "Wrote {} ({} bytes), {} and {}",
        raw_path.display(),
        body.len(),
        gz_path.display(),
        meta_path.display()
    );
    Ok(())
}

fn unpack(args: UnpackArgs) -> Result<(), Box<dyn std::error::Error>> {
    let body = fs::read(&args.data)?;
    let manifest = texstream::bundle::BundleManifest::from_json(&fs::read(&args.manifest)?)?;
    let files = texstream::bundle::unpack(&body, &manifest)?;

    for (path, bytes) in &files {
        let dest = args.out.join(path.trim_start_matches('/'));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, bytes)?;
    }
    println!("Unpacked {} files into {}", files.len(), args.out.display());
    Ok(())
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut Vec<(String, Vec<u8>)>,
) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("entry under root")
                .to_string_lossy()
                .replace('\\', "/");
            files.push((rel, fs::read(&path)?));
        }
    }
    Ok(())
}
