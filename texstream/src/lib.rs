//! texstream — lazy resource fabric for sandboxed WebAssembly TeX engines.
//!
//! Compiles LaTeX documents against a virtual TeX tree assembled on demand
//! from pre-packed bundles, remote packages, and per-file byte-range
//! fetches, instead of shipping the full TeX Live tree up front. A
//! retry-and-resolve loop reads the engine's own error output to decide
//! what to pull next.
//!
//! The engine itself is opaque: embedders supply an
//! [`engine::EngineProvider`] that instantiates the WebAssembly engine
//! image; this crate owns everything the engine reads and writes.
//!
//! ```ignore
//! use std::sync::Arc;
//! use texstream::{CompileOptions, TexStream, TexStreamConfig};
//!
//! let config = TexStreamConfig::new(
//!     "https://bundles.example.org/latest",
//!     "https://bundles.example.org/engine.wasm",
//!     "https://ctan-proxy.example.org",
//!     "/var/cache/texstream",
//! );
//! let service = TexStream::init(config, Arc::new(MyEngineRuntime)).await?;
//! let output = service.compile(source, CompileOptions::new()).await?;
//! ```

pub mod bundle;
pub mod cache;
pub mod compile;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod hash;
pub mod resolve;
mod service;
pub mod vfs;

pub use compile::{CompileError, CompileOptions, CompileOutput, CompileStats};
pub use config::TexStreamConfig;
pub use engine::{Engine, EngineOutcome, EngineProvider, TexEngine};
pub use service::{InitError, TexStream};
