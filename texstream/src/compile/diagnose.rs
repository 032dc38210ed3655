//! Engine log diagnosis.
//!
//! After a failed attempt the log is scanned for the known missing-file
//! error shapes, and the offending file name is normalised to the package
//! that provides it.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// The known missing-file error patterns, in scan order. Each regex
/// captures the missing file name.
static MISSING_FILE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"! LaTeX Error: File `([^']+)' not found",
        r"! I can't find file `([^']+)'",
        r"LaTeX Warning: File `([^']+)' not found",
        r"Package \S+ Error: [^\n]*`([^']+)' not found",
        r"Font \S+=([^\s]+)[^\n]*not loadable: Metric \(TFM\) file",
        r"!pdfTeX error: \(file ([^)]+)\): Font [^\n]* not found",
        r"Font ([^\s]+) at [^\n]* not found",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("missing-file pattern"))
    .collect()
});

static CM_SUPER_FONT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(ec|tc)[a-z]{2}\d+$").expect("cm-super font pattern"));

const STRIP_SUFFIXES: &[&str] = &[".sty", ".cls", ".def", ".clo", ".fd", ".cfg", ".tex"];

/// First missing file in the log that has not been attempted this session.
pub fn find_missing_file(log: &str, attempted: &HashSet<String>) -> Option<String> {
    for pattern in MISSING_FILE_PATTERNS.iter() {
        for captures in pattern.captures_iter(log) {
            let file = captures[1].trim().to_string();
            if !file.is_empty() && !attempted.contains(&file) {
                return Some(file);
            }
        }
    }
    None
}

/// Package that provides a missing file: EC/TC font shapes belong to
/// cm-super, everything else is the file name without its TeX suffix.
pub fn file_to_package(file: &str) -> String {
    let base = file.rsplit('/').next().unwrap_or(file);
    let stem = base.rsplit_once('.').map(|(s, _)| s).unwrap_or(base);
    if CM_SUPER_FONT.is_match(stem) {
        return "cm-super".to_string();
    }
    for suffix in STRIP_SUFFIXES {
        if let Some(stripped) = base.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    base.to_string()
}
