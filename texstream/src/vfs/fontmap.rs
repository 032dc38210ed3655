//! Font map post-processing.
//!
//! kpathsea resolves glyph and encoding files through `pdftex.map`. Inside
//! the VFS those files live at mounted absolute paths, so every `.pfb` and
//! `.enc` reference is rewritten to the absolute path before the engine
//! runs. Queued auxiliary maps are appended to the unified map with the
//! same rewriting applied per line.

use super::{file_name, Vfs, UNIFIED_MAP_NAME};
use crate::engine::TEX_ROOT;

impl Vfs {
    /// Rewrite the unified `pdftex.map` and merge every queued auxiliary
    /// map into it.
    pub(crate) fn process_font_maps(&mut self) {
        let Some(unified_path) = self
            .file_paths()
            .find(|p| file_name(p) == UNIFIED_MAP_NAME)
            .map(str::to_string)
        else {
            return;
        };

        let mut merged = String::new();
        if let Some(base) = self.read(&unified_path) {
            for line in String::from_utf8_lossy(&base).lines() {
                merged.push_str(&self.rewrite_map_line(line, &unified_path));
                merged.push('\n');
            }
        }
        for map_path in self.queued_map_paths() {
            let Some(bytes) = self.read(&map_path) else {
                continue;
            };
            for line in String::from_utf8_lossy(&bytes).lines() {
                merged.push_str(&self.rewrite_map_line(line, &map_path));
                merged.push('\n');
            }
        }
        self.write(&unified_path, merged.into_bytes());
    }

    /// Rewrite one map line. Comment and blank lines pass through
    /// verbatim; `<file.pfb` / `<<file.enc` references keep their prefix
    /// and gain an absolute path when one resolves.
    fn rewrite_map_line(&self, line: &str, map_path: &str) -> String {
        if line.trim().is_empty() || line.starts_with('%') {
            return line.to_string();
        }
        line.split_whitespace()
            .map(|token| self.rewrite_token(token, map_path))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn rewrite_token(&self, token: &str, map_path: &str) -> String {
        let (prefix, tail) = if let Some(tail) = token.strip_prefix("<<") {
            ("<<", tail)
        } else if let Some(tail) = token.strip_prefix('<') {
            ("<", tail)
        } else {
            return token.to_string();
        };
        if !(tail.ends_with(".pfb") || tail.ends_with(".enc")) {
            return token.to_string();
        }
        match self.resolve_font_ref(tail, map_path) {
            Some(path) => format!("{prefix}{path}"),
            None => token.to_string(),
        }
    }

    /// Locate a font file referenced from a map line.
    ///
    /// Search order: the package directory derived from the map's own
    /// path, the same under `cm-super`, then the map's own directory;
    /// failing those, the font index built during bundle mounts.
    fn resolve_font_ref(&self, file: &str, map_path: &str) -> Option<String> {
        let map_dir = match map_path.rfind('/') {
            Some(idx) => &map_path[..idx],
            None => "",
        };
        let pkg = file_name(map_dir);
        let kind_dir = if file.ends_with(".pfb") {
            "type1/public"
        } else {
            "enc/dvips"
        };
        let candidates = [
            format!("{TEX_ROOT}/texmf-dist/fonts/{kind_dir}/{pkg}/{file}"),
            format!("{TEX_ROOT}/texmf-dist/fonts/{kind_dir}/cm-super/{file}"),
            format!("{map_dir}/{file}"),
        ];
        for candidate in &candidates {
            if self.exists(candidate) {
                return Some(candidate.clone());
            }
        }
        self.font_index().get(file).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RangeCache;

    const UNIFIED: &str = "/texlive/texmf-dist/fonts/map/pdftex/updmap/pdftex.map";

    fn vfs_with_fonts() -> Vfs {
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.mount_external_files(
            &[
                (
                    "/texlive/texmf-dist/fonts/type1/public/times/utmr8a.pfb".to_string(),
                    b"pfb".to_vec(),
                ),
                (
                    "/texlive/texmf-dist/fonts/enc/dvips/times/8r.enc".to_string(),
                    b"enc".to_vec(),
                ),
                (
                    "/texlive/texmf-dist/fonts/type1/public/cm-super/sfrm1000.pfb".to_string(),
                    b"pfb".to_vec(),
                ),
            ]
            .into_iter()
            .collect(),
        );
        vfs
    }

    #[test]
    fn test_unified_map_references_become_absolute() {
        let mut vfs = vfs_with_fonts();
        vfs.mount(
            UNIFIED,
            b"utmr8r Times-Roman \"TeXBase1Encoding ReEncodeFont\" <8r.enc <utmr8a.pfb\n"
                .to_vec(),
        );
        vfs.process_font_maps();

        let map = String::from_utf8(vfs.read(UNIFIED).unwrap()).unwrap();
        assert!(map.contains("</texlive/texmf-dist/fonts/enc/dvips/times/8r.enc"));
        assert!(map.contains("</texlive/texmf-dist/fonts/type1/public/times/utmr8a.pfb"));
    }

    #[test]
    fn test_queued_map_appended_with_rewrites() {
        let mut vfs = vfs_with_fonts();
        vfs.mount(UNIFIED, b"% base map\n".to_vec());
        vfs.mount(
            "/texlive/texmf-dist/fonts/map/dvips/times/times.map",
            b"utmr8r Times-Roman <utmr8a.pfb\n".to_vec(),
        );
        vfs.process_font_maps();

        let map = String::from_utf8(vfs.read(UNIFIED).unwrap()).unwrap();
        assert!(map.starts_with("% base map\n"));
        assert!(map.contains("utmr8r Times-Roman </texlive/texmf-dist/fonts/type1/public/times/utmr8a.pfb"));
    }

    #[test]
    fn test_cm_super_fallback() {
        let mut vfs = vfs_with_fonts();
        vfs.mount(UNIFIED, b"% base\n".to_vec());
        // The map sits under a package dir that does not hold the font.
        vfs.mount(
            "/texlive/texmf-dist/fonts/map/dvips/other/other.map",
            b"sfrm1000 SFRM1000 <sfrm1000.pfb\n".to_vec(),
        );
        vfs.process_font_maps();

        let map = String::from_utf8(vfs.read(UNIFIED).unwrap()).unwrap();
        assert!(
            map.contains("</texlive/texmf-dist/fonts/type1/public/cm-super/sfrm1000.pfb")
        );
    }

    #[test]
    fn test_double_angle_prefix_preserved() {
        let mut vfs = vfs_with_fonts();
        vfs.mount(UNIFIED, b"utmr8r Times-Roman <<utmr8a.pfb\n".to_vec());
        vfs.process_font_maps();

        let map = String::from_utf8(vfs.read(UNIFIED).unwrap()).unwrap();
        assert!(map.contains("<</texlive/texmf-dist/fonts/type1/public/times/utmr8a.pfb"));
    }

    #[test]
    fn test_comment_and_blank_lines_verbatim() {
        let mut vfs = vfs_with_fonts();
        vfs.mount(UNIFIED, b"% comment <fake.pfb\n\nreal <utmr8a.pfb\n".to_vec());
        vfs.process_font_maps();

        let map = String::from_utf8(vfs.read(UNIFIED).unwrap()).unwrap();
        assert!(map.contains("% comment <fake.pfb\n"));
        assert!(map.contains("\n\n"));
    }

    #[test]
    fn test_unresolvable_reference_kept() {
        let mut vfs = Vfs::new(RangeCache::new(), true);
        vfs.mount(UNIFIED, b"ghost GHOST <ghost.pfb\n".to_vec());
        vfs.process_font_maps();

        let map = String::from_utf8(vfs.read(UNIFIED).unwrap()).unwrap();
        assert!(map.contains("<ghost.pfb"));
    }
}
