//! Source inspection and rewriting applied before the first attempt.

const BEGIN_DOCUMENT: &str = r"\begin{document}";

/// Everything before the first `\begin{document}`. The whole source when
/// the marker is absent.
pub fn preamble_of(source: &str) -> &str {
    match source.find(BEGIN_DOCUMENT) {
        Some(idx) => &source[..idx],
        None => source,
    }
}

/// The source from `\begin{document}` on, used when a cached format
/// already incorporates the preamble.
pub fn body_from_begin_document(source: &str) -> &str {
    match source.find(BEGIN_DOCUMENT) {
        Some(idx) => &source[idx..],
        None => source,
    }
}

/// Sandbox rewrites applied when compiling without a cached format.
///
/// microtype's font expansion needs `.pfb` data that may not be loadable,
/// so expansion is switched off ahead of `\documentclass`. Skipped under a
/// cached format, which already incorporates the rewrite.
pub fn rewrite_for_sandbox(source: &str) -> String {
    if !uses_microtype(source) {
        return source.to_string();
    }
    match source.find(r"\documentclass") {
        Some(idx) => {
            let mut out = String::with_capacity(source.len() + 64);
            out.push_str(&source[..idx]);
            out.push_str("\\PassOptionsToPackage{expansion=false}{microtype}\n");
            out.push_str(&source[idx..]);
            out
        }
        None => source.to_string(),
    }
}

fn uses_microtype(source: &str) -> bool {
    crate::resolve::extract_declared(source)
        .iter()
        .any(|p| p == "microtype")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_and_body_split() {
        let source = r"\documentclass{article}\begin{document}Hello\end{document}";
        assert_eq!(preamble_of(source), r"\documentclass{article}");
        assert_eq!(
            body_from_begin_document(source),
            r"\begin{document}Hello\end{document}"
        );
    }

    #[test]
    fn test_preamble_without_marker_is_whole_source() {
        let source = r"\documentclass{article}";
        assert_eq!(preamble_of(source), source);
        assert_eq!(body_from_begin_document(source), source);
    }

    #[test]
    fn test_microtype_rewrite_injected_before_documentclass() {
        let source = "% note\n\\documentclass{article}\n\\usepackage{microtype}";
        let rewritten = rewrite_for_sandbox(source);
        let inject = rewritten
            .find(r"\PassOptionsToPackage{expansion=false}{microtype}")
            .unwrap();
        let class = rewritten.find(r"\documentclass").unwrap();
        assert!(inject < class);
        assert!(rewritten.starts_with("% note\n"));
    }

    #[test]
    fn test_no_microtype_no_rewrite() {
        let source = r"\documentclass{article}";
        assert_eq!(rewrite_for_sandbox(source), source);
    }
}
