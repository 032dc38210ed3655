//! The public compile service.
//!
//! # Architecture
//!
//! Two cooperatively scheduled contexts joined by message passing:
//!
//! - the *host* context (the caller's tasks) owns manifests, caches,
//!   network I/O, and the resolver;
//! - the *engine* context is one dedicated task owning the orchestrator,
//!   the engine instances, and each attempt's VFS.
//!
//! Compile and format-generate operations travel over an `mpsc` channel
//! and run strictly FIFO, so a pending format generation always finishes
//! before the next compile's cache lookup, and the engine's internal
//! globals are never touched concurrently.
//!
//! # Startup sequence
//!
//! 1. Open the persistent cache (version gating evicts stale tiers)
//! 2. Fetch the global manifests from the bundle base URL
//! 3. Fetch or reuse the compiled engine image
//! 4. Warm the engines' required bundles
//! 5. Spawn the engine context

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bundle::{
    BundleDeps, BundleRegistry, GlobalFileManifest, ManifestError, PackageDeps, PackageMap,
};
use crate::cache::{CacheError, TexCache};
use crate::compile::{CompileError, CompileOptions, CompileOutput, Orchestrator};
use crate::config::{Hooks, TexStreamConfig};
use crate::engine::{Engine, EngineProvider};
use crate::fetch::{BundleFetcher, FetchError, HttpTransport, PackageFetcher, Transport};

/// Errors raised during `init`.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

enum Job {
    Compile {
        source: String,
        options: CompileOptions,
        respond: oneshot::Sender<Result<CompileOutput, CompileError>>,
    },
    GenerateFormat {
        source: String,
        engine: Option<Engine>,
        respond: oneshot::Sender<Result<Vec<u8>, CompileError>>,
    },
}

/// Handle to a running compile service.
pub struct TexStream {
    jobs: mpsc::Sender<Job>,
    cache: TexCache,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl TexStream {
    /// Initialise the service over HTTP: manifests are preloaded, the
    /// engine image readied, and the engines' required bundles warmed.
    pub async fn init(
        config: TexStreamConfig,
        provider: Arc<dyn EngineProvider>,
    ) -> Result<Self, InitError> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        Self::init_with_transport(config, provider, transport).await
    }

    /// Initialise over a caller-supplied transport (tests use an
    /// in-memory double).
    pub async fn init_with_transport(
        config: TexStreamConfig,
        provider: Arc<dyn EngineProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, InitError> {
        let cache = TexCache::open(&config.cache_dir)?;
        let hooks = Hooks::from_config(&config);
        let base = config.bundles_url.trim_end_matches('/').to_string();

        hooks.progress("loading manifests");
        let global = GlobalFileManifest::from_json(
            &fetch_required(&transport, &format!("{base}/file-manifest.json")).await?,
        )?;
        let registry = BundleRegistry::from_json(
            &fetch_required(&transport, &format!("{base}/registry.json")).await?,
        )?;
        let package_map = PackageMap::from_json(
            &fetch_required(&transport, &format!("{base}/package-map.json")).await?,
        )?;
        let bundle_deps = BundleDeps::from_json(
            &fetch_required(&transport, &format!("{base}/bundle-deps.json")).await?,
        )?;
        let package_deps = match fetch_required(&transport, &format!("{base}/package-deps.json"))
            .await
        {
            Ok(raw) => PackageDeps::from_json(&raw).ok(),
            Err(_) => None,
        };
        info!(
            files = global.len(),
            "manifests loaded"
        );

        hooks.progress("preparing engine image");
        let image = match cache.get_engine_image() {
            Some(image) => image,
            None => {
                let response = fetch_required(&transport, &config.wasm_url).await?;
                cache.put_engine_image(&response);
                response
            }
        };

        let resolver = crate::resolve::Resolver::new(registry, package_map, bundle_deps, package_deps);
        let bundle_fetcher = Arc::new(BundleFetcher::new(
            Arc::clone(&transport),
            cache.clone(),
            &base,
        ));
        let package_fetcher = Arc::new(PackageFetcher::new(
            Arc::clone(&transport),
            cache.clone(),
            &config.ctan_proxy_url,
        ));

        hooks.progress("warming required bundles");
        let mut warm: Vec<String> = Vec::new();
        for engine in [Engine::Pdflatex, Engine::Xelatex] {
            for id in resolver.bundle_deps().required_for(engine.as_str()) {
                if !warm.contains(id) {
                    warm.push(id.clone());
                }
            }
        }
        let warmed =
            futures::future::join_all(warm.iter().map(|id| bundle_fetcher.fetch_bundle(id))).await;
        for (id, result) in warm.iter().zip(warmed) {
            if let Err(e) = result {
                warn!(bundle = %id, error = %e, "bundle warm-up failed");
            }
        }

        let orchestrator = Orchestrator::new(
            cache.clone(),
            resolver,
            global,
            bundle_fetcher,
            package_fetcher,
            provider,
            image,
            config.enable_ctan,
            config.enable_lazy_fs,
            config.enable_doc_cache,
            hooks,
        );

        let (jobs, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(engine_context(orchestrator, rx, cancel.clone()));
        info!("compile service ready");
        Ok(Self {
            jobs,
            cache,
            cancel,
            worker,
        })
    }

    /// Compile a document. Operations queue FIFO behind any in-flight
    /// compile or format generation.
    pub async fn compile(
        &self,
        source: &str,
        options: CompileOptions,
    ) -> Result<CompileOutput, CompileError> {
        let (respond, result) = oneshot::channel();
        self.jobs
            .send(Job::Compile {
                source: source.to_string(),
                options,
                respond,
            })
            .await
            .map_err(|_| CompileError::Terminated)?;
        result.await.map_err(|_| CompileError::Terminated)?
    }

    /// Pre-generate a format file for the source's preamble.
    pub async fn generate_format(
        &self,
        source: &str,
        engine: Option<Engine>,
    ) -> Result<Vec<u8>, CompileError> {
        let (respond, result) = oneshot::channel();
        self.jobs
            .send(Job::GenerateFormat {
                source: source.to_string(),
                engine,
                respond,
            })
            .await
            .map_err(|_| CompileError::Terminated)?;
        result.await.map_err(|_| CompileError::Terminated)?
    }

    /// Drop every durable and in-memory cache tier.
    pub async fn clear_cache(&self) -> Result<(), CacheError> {
        self.cache.clear().await
    }

    pub fn cache(&self) -> &TexCache {
        &self.cache
    }

    /// Stop accepting work. In-flight engine invocations finish; queued
    /// jobs receive `Terminated`.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Terminate and release the engine context.
    pub async fn unload(self) {
        self.cancel.cancel();
        drop(self.jobs);
        let _ = self.worker.await;
    }
}

/// The engine context: one task, one operation at a time, strictly FIFO.
async fn engine_context(
    mut orchestrator: Orchestrator,
    mut jobs: mpsc::Receiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("engine context terminated");
                break;
            }
            job = jobs.recv() => {
                let Some(job) = job else { break };
                match job {
                    Job::Compile { source, options, respond } => {
                        let result = orchestrator.compile(&source, &options).await;
                        let _ = respond.send(result);
                    }
                    Job::GenerateFormat { source, engine, respond } => {
                        let result = orchestrator.generate_format(&source, engine).await;
                        let _ = respond.send(result);
                    }
                }
            }
        }
    }
}

async fn fetch_required(
    transport: &Arc<dyn Transport>,
    url: &str,
) -> Result<Vec<u8>, FetchError> {
    let response = transport.get(url).await?;
    if !response.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status,
        });
    }
    Ok(response.body)
}
