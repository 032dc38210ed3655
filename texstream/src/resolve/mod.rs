//! Maps a document's declared dependencies to the minimal set of bundles
//! that must be present before the engine runs.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::bundle::{BundleDeps, BundleRegistry, PackageDeps, PackageMap};
use crate::engine::Engine;

static DECLARED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:usepackage|documentclass|RequirePackage)\s*(?:\[[^\]]*\])?\s*\{([^}]*)\}")
        .expect("declared-dependency regex")
});

/// Patterns whose presence selects xelatex.
const XELATEX_MARKERS: &[&str] = &[
    r"\usepackage{fontspec}",
    r"\usepackage{unicode-math}",
    r"\setmainfont",
    r"\setsansfont",
    r"\setmonofont",
];

/// Extract the packages a source declares through `\usepackage`,
/// `\documentclass`, and `\RequirePackage`. Options are ignored and the
/// document class is treated as a package.
pub fn extract_declared(source: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut declared = Vec::new();
    for captures in DECLARED_RE.captures_iter(source) {
        for name in captures[1].split(',') {
            let name = name.trim();
            if !name.is_empty() && seen.insert(name.to_string()) {
                declared.push(name.to_string());
            }
        }
    }
    declared
}

/// Pick the engine from the source when the caller asked for `auto`.
pub fn detect_engine(source: &str) -> Engine {
    if XELATEX_MARKERS.iter().any(|marker| source.contains(marker)) {
        Engine::Xelatex
    } else {
        Engine::Pdflatex
    }
}

/// Resolves declared packages to required bundles across the bundle and
/// package dependency graphs.
pub struct Resolver {
    registry: BundleRegistry,
    package_map: PackageMap,
    bundle_deps: BundleDeps,
    package_deps: Option<PackageDeps>,
}

impl Resolver {
    pub fn new(
        registry: BundleRegistry,
        package_map: PackageMap,
        bundle_deps: BundleDeps,
        package_deps: Option<PackageDeps>,
    ) -> Self {
        Self {
            registry,
            package_map,
            bundle_deps,
            package_deps,
        }
    }

    pub fn package_map(&self) -> &PackageMap {
        &self.package_map
    }

    pub fn bundle_deps(&self) -> &BundleDeps {
        &self.bundle_deps
    }

    /// Ordered set of bundles this compile needs: the engine's mandated
    /// bundles, plus the closure of every declared package over the bundle
    /// (and optional package) dependency graphs, filtered to the registry.
    pub fn resolve(&self, source: &str, engine: Engine) -> Vec<String> {
        let mut out = Vec::new();
        let mut visited_bundles = HashSet::new();
        let mut visited_packages = HashSet::new();

        for bundle in self.bundle_deps.required_for(engine.as_str()) {
            self.add_bundle(bundle, &mut out, &mut visited_bundles);
        }
        for package in extract_declared(source) {
            self.add_package(&package, &mut out, &mut visited_bundles, &mut visited_packages);
        }
        out
    }

    fn add_bundle(
        &self,
        bundle: &str,
        out: &mut Vec<String>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(bundle.to_string()) {
            return;
        }
        if self.registry.contains(bundle) {
            out.push(bundle.to_string());
        }
        for dep in self.bundle_deps.requires(bundle) {
            self.add_bundle(dep, out, visited);
        }
    }

    fn add_package(
        &self,
        package: &str,
        out: &mut Vec<String>,
        visited_bundles: &mut HashSet<String>,
        visited_packages: &mut HashSet<String>,
    ) {
        if !visited_packages.insert(package.to_string()) {
            return;
        }
        if let Some(bundle) = self.package_map.bundle_for(package) {
            self.add_bundle(bundle, out, visited_bundles);
        }
        if let Some(deps) = &self.package_deps {
            for dep in deps.deps_of(package) {
                self.add_package(dep, out, visited_bundles, visited_packages);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> Resolver {
        let registry = BundleRegistry::from_ids(
            ["latex-base", "fonts-cm", "amsmath-bundle", "graphics"]
                .map(String::from),
        );
        let package_map = PackageMap::from_entries([
            ("article".to_string(), "latex-base".to_string()),
            ("amsmath".to_string(), "amsmath-bundle".to_string()),
            ("graphicx".to_string(), "graphics".to_string()),
            ("ghost".to_string(), "not-in-registry".to_string()),
        ]);
        let bundle_deps = BundleDeps::from_json(
            br#"{
                "engines": {
                    "pdflatex": {"required": ["latex-base"]},
                    "xelatex": {"required": ["latex-base"]}
                },
                "bundles": {
                    "latex-base": {"requires": ["fonts-cm"]},
                    "amsmath-bundle": {"requires": ["latex-base"]}
                }
            }"#,
        )
        .unwrap();
        Resolver::new(registry, package_map, bundle_deps, None)
    }

    #[test]
    fn test_extract_declared_patterns() {
        let source = r"\documentclass[11pt]{article}
\usepackage{amsmath, amssymb}
\RequirePackage[T1]{fontenc}";
        assert_eq!(
            extract_declared(source),
            ["article", "amsmath", "amssymb", "fontenc"]
        );
    }

    #[test]
    fn test_extract_declared_dedupes() {
        let source = r"\usepackage{amsmath}\usepackage{amsmath}";
        assert_eq!(extract_declared(source), ["amsmath"]);
    }

    #[test]
    fn test_resolve_hello_world_is_engine_required_only() {
        let source = r"\documentclass{article}\begin{document}Hello\end{document}";
        let bundles = resolver().resolve(source, Engine::Pdflatex);
        assert_eq!(bundles, ["latex-base", "fonts-cm"]);
    }

    #[test]
    fn test_resolve_closed_under_bundle_deps() {
        let source = r"\documentclass{article}\usepackage{amsmath}\begin{document}x\end{document}";
        let resolver = resolver();
        let bundles = resolver.resolve(source, Engine::Pdflatex);
        assert!(bundles.contains(&"amsmath-bundle".to_string()));
        // amsmath-bundle requires latex-base requires fonts-cm, both present.
        assert!(bundles.contains(&"latex-base".to_string()));
        assert!(bundles.contains(&"fonts-cm".to_string()));
        for bundle in &bundles {
            for dep in resolver.bundle_deps.requires(bundle) {
                assert!(bundles.contains(dep), "{bundle} requires missing {dep}");
            }
        }
    }

    #[test]
    fn test_resolve_filters_to_registry() {
        let source = r"\usepackage{ghost}";
        let bundles = resolver().resolve(source, Engine::Pdflatex);
        assert!(!bundles.iter().any(|b| b == "not-in-registry"));
    }

    #[test]
    fn test_resolve_unknown_package_is_silent() {
        // Unmapped packages are left for the engine to surface; the
        // orchestrator handles the resulting missing-file error.
        let source = r"\usepackage{foo-notbundled}";
        let bundles = resolver().resolve(source, Engine::Pdflatex);
        assert_eq!(bundles, ["latex-base", "fonts-cm"]);
    }

    #[test]
    fn test_package_deps_walked() {
        let registry =
            BundleRegistry::from_ids(["latex-base", "b-x", "b-y"].map(String::from));
        let package_map = PackageMap::from_entries([
            ("x".to_string(), "b-x".to_string()),
            ("y".to_string(), "b-y".to_string()),
        ]);
        let bundle_deps = BundleDeps::from_json(br#"{"engines":{},"bundles":{}}"#).unwrap();
        let package_deps =
            PackageDeps::from_json(br#"{"x": ["y"], "y": ["x"]}"#).unwrap();
        let resolver = Resolver::new(registry, package_map, bundle_deps, Some(package_deps));
        // Cyclic package deps terminate via the visited set.
        let bundles = resolver.resolve(r"\usepackage{x}", Engine::Pdflatex);
        assert_eq!(bundles, ["b-x", "b-y"]);
    }

    #[test]
    fn test_detect_engine() {
        assert_eq!(
            detect_engine(r"\usepackage{fontspec}\setmainfont{Lato}"),
            Engine::Xelatex
        );
        assert_eq!(
            detect_engine(r"\usepackage{unicode-math}"),
            Engine::Xelatex
        );
        assert_eq!(
            detect_engine(r"\documentclass{article}"),
            Engine::Pdflatex
        );
    }
}
