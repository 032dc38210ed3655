//! kpathsea `ls-R` index generation.

use std::collections::{BTreeMap, BTreeSet};

const HEADER: &str = "% ls-R -- filename database.";

/// Build the `ls-R` index for every mounted file under `root`: each
/// directory followed by its files and subdirectories in sorted order,
/// separated by blank lines.
pub(crate) fn generate<'a>(paths: impl Iterator<Item = &'a str>, root: &str) -> String {
    let prefix = format!("{}/", root.trim_end_matches('/'));
    let mut dirs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    dirs.insert(String::new(), BTreeSet::new());

    for path in paths {
        let Some(rel) = path.strip_prefix(&prefix) else {
            continue;
        };
        let mut parent = String::new();
        let mut components = rel.split('/').peekable();
        while let Some(component) = components.next() {
            dirs.entry(parent.clone())
                .or_default()
                .insert(component.to_string());
            if components.peek().is_some() {
                if !parent.is_empty() {
                    parent.push('/');
                }
                parent.push_str(component);
                dirs.entry(parent.clone()).or_default();
            }
        }
    }

    let mut out = String::from(HEADER);
    out.push('\n');
    for (dir, entries) in &dirs {
        if dir.is_empty() {
            out.push_str("./:\n");
        } else {
            out.push_str(&format!("./{dir}:\n"));
        }
        for entry in entries {
            out.push_str(entry);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}
