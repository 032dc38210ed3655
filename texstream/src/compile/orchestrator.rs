//! The retry-and-resolve compile loop.
//!
//! One compile walks RESOLVE → LOAD_BUNDLES → BUILD_VFS → RUN_ENGINE; on
//! failure the orchestrator consults, in order, the byte-range requests the
//! VFS gathered during deferred reads, pending whole-bundle requests, and
//! the engine log's missing-file errors, fetches what it can, and retries
//! with a fresh engine instance over a rebuilt VFS. Bundle bodies, fetched
//! packages, and byte ranges accumulate across retries; the engine instance
//! never survives one (its internal globals do not reset).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bundle::{BundleManifest, GlobalFileManifest};
use crate::cache::{CachedPackage, TexCache};
use crate::config::Hooks;
use crate::engine::{
    compile_argv, engine_env, ini_argv, xdvipdfmx_argv, Engine, EngineOutcome, EngineProvider,
    CUSTOM_FORMAT_PATH, DOCUMENT_PATH, FORMAT_INI_PATH,
};
use crate::fetch::{BundleFetcher, PackageFetcher};
use crate::hash::djb2;
use crate::resolve::{detect_engine, Resolver};
use crate::vfs::Vfs;

use super::source;
use super::{
    diagnose, CompileError, CompileOptions, CompileOutput, CompileStats, COMPILE_TIMEOUT_SECS,
    FORMAT_TIMEOUT_SECS, MAX_RETRIES, PACKAGE_FETCH_TIMEOUT_SECS, RANGE_FETCH_TIMEOUT_SECS,
};

/// Engine outputs collected into the aux cache after a successful run.
const AUX_EXTENSIONS: &[&str] = &[
    ".aux", ".toc", ".lof", ".lot", ".out", ".bbl", ".nav", ".snm", ".vrb", ".idx",
];

/// Per-compile working set: the bundles to mount and the per-bundle
/// manifests fetched for bundles the global manifest does not index.
struct Attempt {
    required: Vec<String>,
    manifests: HashMap<String, Arc<BundleManifest>>,
}

/// Drives the whole compile pipeline. Owned by the engine context; one
/// operation runs at a time.
pub struct Orchestrator {
    cache: TexCache,
    resolver: Resolver,
    global_manifest: GlobalFileManifest,
    bundle_fetcher: Arc<BundleFetcher>,
    package_fetcher: Arc<PackageFetcher>,
    provider: Arc<dyn EngineProvider>,
    image: Vec<u8>,
    enable_ctan: bool,
    enable_lazy_fs: bool,
    enable_doc_cache: bool,
    hooks: Hooks,
    // Session state, retained across compiles.
    fetched_packages: HashMap<String, Arc<CachedPackage>>,
    attempted_files: HashSet<String>,
    package_failures: HashMap<String, u32>,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub(crate) fn new(
        cache: TexCache,
        resolver: Resolver,
        global_manifest: GlobalFileManifest,
        bundle_fetcher: Arc<BundleFetcher>,
        package_fetcher: Arc<PackageFetcher>,
        provider: Arc<dyn EngineProvider>,
        image: Vec<u8>,
        enable_ctan: bool,
        enable_lazy_fs: bool,
        enable_doc_cache: bool,
        hooks: Hooks,
    ) -> Self {
        Self {
            cache,
            resolver,
            global_manifest,
            bundle_fetcher,
            package_fetcher,
            provider,
            image,
            enable_ctan,
            enable_lazy_fs,
            enable_doc_cache,
            hooks,
            fetched_packages: HashMap::new(),
            attempted_files: HashSet::new(),
            package_failures: HashMap::new(),
        }
    }

    pub fn cache(&self) -> &TexCache {
        &self.cache
    }

    /// Compile a document. Engine failures that defeat diagnosis return a
    /// `CompileOutput` with `success == false`; only caps and
    /// infrastructure faults are `Err`.
    pub async fn compile(
        &mut self,
        source_text: &str,
        options: &CompileOptions,
    ) -> Result<CompileOutput, CompileError> {
        let start = Instant::now();
        let engine = options.engine.unwrap_or_else(|| detect_engine(source_text));
        let document_hash = djb2(source_text);
        self.hooks.progress(&format!("resolving for {engine}"));

        if options.use_cache && self.enable_doc_cache {
            if let Some(pdf) = self.cache.get_pdf(document_hash, engine.as_str()).await {
                info!(engine = %engine, hash = format!("{document_hash:08x}"), "document cache hit");
                self.hooks.log("Using cached PDF");
                return Ok(CompileOutput {
                    success: true,
                    pdf: Some(pdf),
                    exit_code: Some(0),
                    log: Some("Using cached PDF".to_string()),
                    stats: CompileStats {
                        duration_ms: start.elapsed().as_millis() as u64,
                        ..Default::default()
                    },
                    cached: true,
                });
            }
        }

        let preamble_hash = djb2(source::preamble_of(source_text));
        let format = if options.use_cache && engine == Engine::Pdflatex {
            self.cache.get_format(preamble_hash, engine.as_str())
        } else {
            None
        };
        let used_format = format.is_some();

        // With a cached format the preamble is already dumped; without one,
        // sandbox rewrites apply.
        let document = if used_format {
            source::body_from_begin_document(source_text).to_string()
        } else {
            source::rewrite_for_sandbox(source_text)
        };
        let aux_key = if used_format {
            format!("{preamble_hash:08x}_fmt")
        } else {
            format!("{preamble_hash:08x}")
        };
        let aux_files = if options.use_cache {
            self.cache.get_aux(&aux_key)
        } else {
            None
        };

        let mut attempt = self.prepare_attempt(source_text, engine).await;
        let mut last_log = String::new();
        let mut last_exit = 1;

        for attempt_no in 0..MAX_RETRIES {
            if start.elapsed() > Duration::from_secs(COMPILE_TIMEOUT_SECS) {
                return Err(CompileError::CapExceeded {
                    what: "compile wall clock".to_string(),
                    log: last_log,
                });
            }
            self.hooks.progress(&format!("engine attempt {attempt_no}"));

            let mut vfs = self.build_vfs(
                &attempt,
                engine,
                format.as_deref(),
                aux_files.as_ref(),
                &options.additional_files,
                DOCUMENT_PATH,
                &document,
            );
            let fmt_arg = if used_format {
                CUSTOM_FORMAT_PATH
            } else {
                engine.as_str()
            };
            let outcome = self.run_engine(&compile_argv(engine, fmt_arg), &mut vfs)?;
            let log = collect_log(&outcome, &mut vfs, "/document.log");
            self.hooks.log(&log);
            last_exit = outcome.exit_code;
            last_log = log;

            if outcome.success() {
                if let Some(pdf) = self.finish_document(engine, &mut vfs)? {
                    let aux = collect_aux_files(&mut vfs);
                    if options.use_cache && !aux.is_empty() {
                        self.cache.put_aux(&aux_key, &aux);
                    }
                    if options.use_cache && self.enable_doc_cache {
                        self.cache
                            .put_pdf(document_hash, engine.as_str(), &pdf)
                            .await;
                    }
                    info!(
                        attempts = attempt_no + 1,
                        bytes = pdf.len(),
                        engine = %engine,
                        "compile succeeded"
                    );
                    return Ok(CompileOutput {
                        success: true,
                        pdf: Some(pdf),
                        exit_code: Some(0),
                        log: Some(last_log),
                        stats: self.stats(&vfs, &attempt, attempt_no + 1, used_format, start),
                        cached: false,
                    });
                }
                // Exit 0 without a PDF still counts as a failed attempt.
                last_exit = 1;
            }

            if !self.diagnose_and_fetch(&vfs, &last_log, &mut attempt).await {
                warn!(exit_code = last_exit, "no actionable diagnosis, compile failed");
                return Ok(CompileOutput {
                    success: false,
                    pdf: None,
                    exit_code: Some(last_exit),
                    log: Some(last_log),
                    stats: self.stats(&vfs, &attempt, attempt_no + 1, used_format, start),
                    cached: false,
                });
            }
        }

        Err(CompileError::CapExceeded {
            what: format!("retry limit ({MAX_RETRIES} attempts)"),
            log: last_log,
        })
    }

    /// Generate (or reuse) a format file for the source's preamble.
    pub async fn generate_format(
        &mut self,
        source_text: &str,
        engine_opt: Option<Engine>,
    ) -> Result<Vec<u8>, CompileError> {
        let start = Instant::now();
        let engine = engine_opt.unwrap_or_else(|| detect_engine(source_text));
        let preamble = source::preamble_of(source_text);
        let preamble_hash = djb2(preamble);

        if let Some(fmt) = self.cache.get_format(preamble_hash, engine.as_str()) {
            debug!(engine = %engine, "format cache hit");
            return Ok(fmt);
        }
        self.hooks.progress("generating format");

        let ini = format!("{preamble}\n\\dump\n");
        let no_extra = HashMap::new();
        let mut attempt = self.prepare_attempt(source_text, engine).await;
        let mut last_log = String::new();

        for _ in 0..MAX_RETRIES {
            if start.elapsed() > Duration::from_secs(FORMAT_TIMEOUT_SECS) {
                return Err(CompileError::CapExceeded {
                    what: "format generation wall clock".to_string(),
                    log: last_log,
                });
            }
            let mut vfs =
                self.build_vfs(&attempt, engine, None, None, &no_extra, FORMAT_INI_PATH, &ini);
            let outcome = self.run_engine(&ini_argv(engine), &mut vfs)?;
            let log = collect_log(&outcome, &mut vfs, "/myformat.log");
            self.hooks.log(&log);
            last_log = log;

            if outcome.success() {
                if let Some(fmt) = vfs.read("/myformat.fmt") {
                    info!(engine = %engine, bytes = fmt.len(), "format generated");
                    self.cache.put_format(preamble_hash, engine.as_str(), &fmt);
                    return Ok(fmt);
                }
            }
            if !self.diagnose_and_fetch(&vfs, &last_log, &mut attempt).await {
                return Err(CompileError::FormatFailed(last_log));
            }
        }

        Err(CompileError::CapExceeded {
            what: format!("format retry limit ({MAX_RETRIES} attempts)"),
            log: last_log,
        })
    }

    // ---- attempt assembly --------------------------------------------------

    /// RESOLVE + LOAD_BUNDLES: pick the required set and fetch every
    /// non-deferred body up front, in parallel. Fetch failures are logged;
    /// the affected bundle may still resolve on a later iteration.
    async fn prepare_attempt(&self, source_text: &str, engine: Engine) -> Attempt {
        let required = self.resolver.resolve(source_text, engine);
        debug!(bundles = ?required, "resolved required bundles");

        let to_fetch: Vec<String> = required
            .iter()
            .filter(|id| {
                !self.resolver.bundle_deps().is_deferred(id, engine.as_str())
                    || !self.enable_lazy_fs
            })
            .cloned()
            .collect();
        let results = futures::future::join_all(
            to_fetch
                .iter()
                .map(|id| self.bundle_fetcher.fetch_bundle(id)),
        )
        .await;
        for (id, result) in to_fetch.iter().zip(results) {
            if let Err(e) = result {
                warn!(bundle = %id, error = %e, "bundle fetch failed");
            }
        }

        let mut manifests = HashMap::new();
        for id in &required {
            if self.global_manifest.files_of(id).is_empty() {
                match self.bundle_fetcher.fetch_manifest(id).await {
                    Ok(manifest) => {
                        manifests.insert(id.clone(), manifest);
                    }
                    Err(e) => debug!(bundle = %id, error = %e, "no per-bundle manifest"),
                }
            }
        }
        Attempt {
            required,
            manifests,
        }
    }

    /// BUILD_VFS: a fresh tree from the accumulated session state. All
    /// mounts land before `finalize` runs the font-map and `ls-R` passes.
    #[allow(clippy::too_many_arguments)]
    fn build_vfs(
        &self,
        attempt: &Attempt,
        engine: Engine,
        format: Option<&[u8]>,
        aux_files: Option<&HashMap<String, Vec<u8>>>,
        additional_files: &HashMap<String, Vec<u8>>,
        doc_path: &str,
        doc: &str,
    ) -> Vfs {
        let mut vfs = Vfs::new(self.bundle_fetcher.range_cache(), self.enable_lazy_fs);
        for id in &attempt.required {
            let per_bundle = attempt.manifests.get(id).map(Arc::as_ref);
            match self.cache.get_bundle(id) {
                Some(body) => vfs.mount_bundle(id, body, &self.global_manifest, per_bundle),
                None => vfs.mount_deferred_bundle(id, &self.global_manifest, per_bundle),
            }
        }
        for package in self.fetched_packages.values() {
            if !package.not_found {
                vfs.mount_external_files(&package.files);
            }
        }
        if !additional_files.is_empty() {
            vfs.mount_external_files(additional_files);
        }
        if let Some(fmt) = format {
            vfs.mount(CUSTOM_FORMAT_PATH, fmt.to_vec());
        }
        if let Some(aux) = aux_files {
            for (path, bytes) in aux {
                vfs.write(path, bytes.clone());
            }
        }
        vfs.write(doc_path, doc.as_bytes().to_vec());
        vfs.finalize();
        debug!(
            files = vfs.file_count(),
            engine = %engine,
            "virtual file system assembled"
        );
        vfs
    }

    /// RUN_ENGINE with a fresh instance; reuse across invocations is
    /// unsafe because the engine's C globals never reset.
    fn run_engine(
        &self,
        argv: &[String],
        vfs: &mut Vfs,
    ) -> Result<EngineOutcome, CompileError> {
        let mut instance = self.provider.instantiate(&self.image)?;
        Ok(instance.run(argv, &engine_env(), vfs)?)
    }

    /// The xelatex path produces an XDV that xdvipdfmx turns into the PDF.
    fn finish_document(
        &self,
        engine: Engine,
        vfs: &mut Vfs,
    ) -> Result<Option<Vec<u8>>, CompileError> {
        if engine == Engine::Xelatex {
            if !vfs.exists("/document.xdv") {
                return Ok(None);
            }
            let outcome = self.run_engine(&xdvipdfmx_argv(), vfs)?;
            if !outcome.success() {
                warn!(exit_code = outcome.exit_code, "xdvipdfmx failed");
                return Ok(None);
            }
        }
        Ok(vfs.read("/document.pdf"))
    }

    // ---- diagnosis ---------------------------------------------------------

    /// DIAGNOSE: pending byte ranges first, then pending whole bundles,
    /// then the engine log. Returns whether anything was fetched that makes
    /// another attempt worthwhile.
    async fn diagnose_and_fetch(
        &mut self,
        vfs: &Vfs,
        log: &str,
        attempt: &mut Attempt,
    ) -> bool {
        let ranges = vfs.pending_ranges().to_vec();
        if !ranges.is_empty() {
            let mut fetched = false;
            for slice in ranges {
                let fetch =
                    self.bundle_fetcher
                        .fetch_range(&slice.bundle, slice.start, slice.end);
                match timeout(Duration::from_secs(RANGE_FETCH_TIMEOUT_SECS), fetch).await {
                    Ok(Ok(_)) => fetched = true,
                    Ok(Err(e)) => {
                        warn!(bundle = %slice.bundle, start = slice.start, error = %e, "byte-range fetch failed")
                    }
                    Err(_) => {
                        warn!(bundle = %slice.bundle, start = slice.start, "byte-range fetch timed out")
                    }
                }
            }
            if fetched {
                return true;
            }
        }

        let pending_bundles = vfs.pending_bundles().to_vec();
        if !pending_bundles.is_empty() {
            let mut fetched = false;
            for id in pending_bundles {
                match self.bundle_fetcher.fetch_bundle(&id).await {
                    Ok(_) => {
                        fetched = true;
                        if !attempt.required.contains(&id) {
                            attempt.required.push(id);
                        }
                    }
                    Err(e) => warn!(bundle = %id, error = %e, "deferred bundle fetch failed"),
                }
            }
            if fetched {
                return true;
            }
        }

        // Log scan: first missing file not yet attempted this session.
        while let Some(file) = diagnose::find_missing_file(log, &self.attempted_files) {
            self.attempted_files.insert(file.clone());
            let package = diagnose::file_to_package(&file);
            let failures = self.package_failures.get(&package).copied().unwrap_or(0);
            if failures >= 2 {
                debug!(package = %package, "already failed twice, not retrying");
                continue;
            }

            if let Some(bundle) = self.resolver.package_map().bundle_for(&package) {
                let bundle = bundle.to_string();
                self.hooks
                    .progress(&format!("fetching bundle {bundle} for {package}"));
                match self.load_bundle(&bundle, &mut attempt.manifests).await {
                    Ok(()) => {
                        if !attempt.required.contains(&bundle) {
                            attempt.required.push(bundle);
                        }
                        return true;
                    }
                    Err(e) => {
                        warn!(bundle = %bundle, error = %e, "bundle fetch failed");
                        *self.package_failures.entry(package).or_insert(0) += 1;
                        continue;
                    }
                }
            }

            if !self.enable_ctan {
                debug!(package = %package, "not in map and remote fetch disabled");
                continue;
            }
            self.hooks
                .progress(&format!("fetching package {package}"));
            let fetch = self.package_fetcher.fetch(&package);
            match timeout(Duration::from_secs(PACKAGE_FETCH_TIMEOUT_SECS), fetch).await {
                Ok(Ok(fetched)) => {
                    // Declared dependencies ride along on the next attempt
                    // through the same missing-file path if actually used.
                    self.fetched_packages.insert(package, fetched);
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(package = %package, error = %e, "package fetch failed");
                    *self.package_failures.entry(package).or_insert(0) += 1;
                }
                Err(_) => {
                    warn!(package = %package, "package fetch timed out");
                    *self.package_failures.entry(package).or_insert(0) += 1;
                }
            }
        }
        false
    }

    async fn load_bundle(
        &self,
        id: &str,
        manifests: &mut HashMap<String, Arc<BundleManifest>>,
    ) -> Result<(), crate::fetch::FetchError> {
        if self.global_manifest.files_of(id).is_empty() && !manifests.contains_key(id) {
            if let Ok(manifest) = self.bundle_fetcher.fetch_manifest(id).await {
                manifests.insert(id.to_string(), manifest);
            }
        }
        self.bundle_fetcher.fetch_bundle(id).await?;
        Ok(())
    }

    fn stats(
        &self,
        vfs: &Vfs,
        attempt: &Attempt,
        attempts: u32,
        used_format: bool,
        start: Instant,
    ) -> CompileStats {
        CompileStats {
            attempts,
            bytes_read: vfs.bytes_read(),
            files_read: vfs.read_count(),
            bundles_mounted: attempt.required.len(),
            packages_fetched: self.fetched_packages.len(),
            ranges_fetched: self.bundle_fetcher.range_cache().len(),
            used_format,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Combined engine output: stdout/stderr stream plus the `.log` file the
/// engine wrote into the VFS.
fn collect_log(outcome: &EngineOutcome, vfs: &mut Vfs, log_path: &str) -> String {
    let mut log = outcome.output.clone();
    if let Some(file) = vfs.read(log_path) {
        if !file.is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&String::from_utf8_lossy(&file));
        }
    }
    log
}

/// Engine-written auxiliary files worth carrying into the next compile of
/// the same preamble.
fn collect_aux_files(vfs: &mut Vfs) -> HashMap<String, Vec<u8>> {
    let paths: Vec<String> = vfs
        .file_paths()
        .filter(|p| {
            p.starts_with("/document.") && AUX_EXTENSIONS.iter().any(|ext| p.ends_with(ext))
        })
        .map(str::to_string)
        .collect();
    let mut aux = HashMap::new();
    for path in paths {
        if let Some(bytes) = vfs.read(&path) {
            aux.insert(path, bytes);
        }
    }
    aux
}
