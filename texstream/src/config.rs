//! Service configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Observation hook payload: free-form strings.
pub type Hook = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for [`crate::TexStream::init`].
#[derive(Clone)]
pub struct TexStreamConfig {
    /// Base URL for bundle bodies and the global manifests.
    pub bundles_url: String,
    /// URL of the compiled engine image.
    pub wasm_url: String,
    /// Base URL of the remote package proxy.
    pub ctan_proxy_url: String,
    /// Root directory of the durable caches.
    pub cache_dir: PathBuf,
    /// Fall back to the remote package proxy for unmapped packages.
    pub enable_ctan: bool,
    /// Mount bundle files lazily and defer listed bundles; when false every
    /// bundle file is loaded eagerly.
    pub enable_lazy_fs: bool,
    /// Cache compiled PDFs by `(document_hash, engine)`.
    pub enable_doc_cache: bool,
    /// Engine log observation hook.
    pub on_log: Option<Hook>,
    /// Progress observation hook.
    pub on_progress: Option<Hook>,
}

impl TexStreamConfig {
    pub fn new(
        bundles_url: impl Into<String>,
        wasm_url: impl Into<String>,
        ctan_proxy_url: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bundles_url: bundles_url.into(),
            wasm_url: wasm_url.into(),
            ctan_proxy_url: ctan_proxy_url.into(),
            cache_dir: cache_dir.into(),
            enable_ctan: true,
            enable_lazy_fs: true,
            enable_doc_cache: true,
            on_log: None,
            on_progress: None,
        }
    }

    pub fn with_ctan(mut self, enabled: bool) -> Self {
        self.enable_ctan = enabled;
        self
    }

    pub fn with_lazy_fs(mut self, enabled: bool) -> Self {
        self.enable_lazy_fs = enabled;
        self
    }

    pub fn with_doc_cache(mut self, enabled: bool) -> Self {
        self.enable_doc_cache = enabled;
        self
    }

    pub fn with_log_hook(mut self, hook: Hook) -> Self {
        self.on_log = Some(hook);
        self
    }

    pub fn with_progress_hook(mut self, hook: Hook) -> Self {
        self.on_progress = Some(hook);
        self
    }
}

impl fmt::Debug for TexStreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TexStreamConfig")
            .field("bundles_url", &self.bundles_url)
            .field("wasm_url", &self.wasm_url)
            .field("ctan_proxy_url", &self.ctan_proxy_url)
            .field("cache_dir", &self.cache_dir)
            .field("enable_ctan", &self.enable_ctan)
            .field("enable_lazy_fs", &self.enable_lazy_fs)
            .field("enable_doc_cache", &self.enable_doc_cache)
            .field("on_log", &self.on_log.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// The configured observation hooks, cheap to clone and safe to fire from
/// the engine context.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    on_log: Option<Hook>,
    on_progress: Option<Hook>,
}

impl Hooks {
    pub fn from_config(config: &TexStreamConfig) -> Self {
        Self {
            on_log: config.on_log.clone(),
            on_progress: config.on_progress.clone(),
        }
    }

    pub fn log(&self, message: &str) {
        if let Some(hook) = &self.on_log {
            hook(message);
        }
    }

    pub fn progress(&self, message: &str) {
        tracing::debug!(progress = %message);
        if let Some(hook) = &self.on_progress {
            hook(message);
        }
    }
}
