//! Packing and unpacking of bundle bodies.
//!
//! The body is the concatenation of every file's bytes in manifest order
//! with no padding, so `pack` then `unpack` reproduces the input file map
//! exactly.

use std::collections::BTreeMap;

use super::manifest::{BundleEntry, BundleManifest, ManifestError};

/// Pack an ordered set of `(full_path, bytes)` pairs into a bundle body and
/// its manifest. Manifest order is the input order.
pub fn pack(name: &str, files: &[(String, Vec<u8>)]) -> (Vec<u8>, BundleManifest) {
    let mut body = Vec::new();
    let mut entries = Vec::with_capacity(files.len());
    for (full_path, bytes) in files {
        let (dir, file_name) = split_path(full_path);
        let start = body.len() as u64;
        body.extend_from_slice(bytes);
        entries.push(BundleEntry {
            path: dir.to_string(),
            name: file_name.to_string(),
            start,
            end: body.len() as u64,
        });
    }
    let manifest = BundleManifest {
        name: name.to_string(),
        files: entries,
        total_size: body.len() as u64,
    };
    (body, manifest)
}

/// Recover the file map from a body and its manifest. The manifest is
/// validated against the body first so a truncated blob never yields
/// silently short files.
pub fn unpack(
    body: &[u8],
    manifest: &BundleManifest,
) -> Result<BTreeMap<String, Vec<u8>>, ManifestError> {
    manifest.validate(body.len() as u64)?;
    let mut files = BTreeMap::new();
    for entry in &manifest.files {
        files.insert(
            entry.full_path(),
            body[entry.start as usize..entry.end as usize].to_vec(),
        );
    }
    Ok(files)
}

fn split_path(full_path: &str) -> (&str, &str) {
    match full_path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", full_path),
    }
}
