//! The TeX engine contract.
//!
//! The engine itself is an opaque collaborator: the embedder supplies an
//! [`EngineProvider`] that instantiates one [`TexEngine`] per invocation
//! from the compiled engine image. The engine carries internal globals
//! that do not reset between invocations, so a fresh instance is obtained
//! for every attempt; this module only fixes the argv and environment the
//! engine is invoked with.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::vfs::Vfs;

/// Root of the TeX tree inside the engine namespace.
pub const TEX_ROOT: &str = "/texlive";

/// Path the document source is mounted at.
pub const DOCUMENT_PATH: &str = "/document.tex";

/// Path a cached format file is mounted at.
pub const CUSTOM_FORMAT_PATH: &str = "/custom.fmt";

/// Paths used by ini-mode format generation.
pub const FORMAT_INI_PATH: &str = "/myformat.ini";
pub const FORMAT_JOB_NAME: &str = "myformat";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to instantiate engine: {0}")]
    Instantiate(String),

    #[error("engine invocation failed: {0}")]
    Run(String),
}

/// Supported engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Pdflatex,
    Xelatex,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Pdflatex => "pdflatex",
            Engine::Xelatex => "xelatex",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdflatex" => Ok(Engine::Pdflatex),
            "xelatex" => Ok(Engine::Xelatex),
            other => Err(format!("unknown engine: {other}")),
        }
    }
}

/// Result of one engine invocation: the exit code and the combined
/// stdout/stderr stream. The `.log` file is read from the VFS separately.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub exit_code: i32,
    pub output: String,
}

impl EngineOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One live engine instance. Runs exactly as a subprocess-like entry point
/// would: argv, environment, and the VFS standing in for its filesystem.
pub trait TexEngine: Send {
    fn run(
        &mut self,
        argv: &[String],
        env: &HashMap<String, String>,
        vfs: &mut Vfs,
    ) -> Result<EngineOutcome, EngineError>;
}

/// Instantiates fresh engine instances from the compiled engine image.
pub trait EngineProvider: Send + Sync {
    fn instantiate(&self, image: &[u8]) -> Result<Box<dyn TexEngine>, EngineError>;
}

/// argv for a document compile.
pub fn compile_argv(engine: Engine, format: &str) -> Vec<String> {
    vec![
        engine.as_str().to_string(),
        "--no-shell-escape".to_string(),
        "--interaction=nonstopmode".to_string(),
        "--halt-on-error".to_string(),
        format!("--fmt={format}"),
        DOCUMENT_PATH.to_string(),
    ]
}

/// argv for the xdvipdfmx pass that follows a successful xelatex run.
pub fn xdvipdfmx_argv() -> Vec<String> {
    vec![
        "xdvipdfmx".to_string(),
        "-o".to_string(),
        "/document.pdf".to_string(),
        "/document.xdv".to_string(),
    ]
}

/// argv for ini-mode format generation.
pub fn ini_argv(engine: Engine) -> Vec<String> {
    vec![
        engine.as_str().to_string(),
        "-ini".to_string(),
        format!("-jobname={FORMAT_JOB_NAME}"),
        "-interaction=nonstopmode".to_string(),
        format!("&{}", engine.as_str()),
        FORMAT_INI_PATH.to_string(),
    ]
}

/// Environment the engine must see before invocation: kpathsea roots and
/// recursive search paths under the TeX tree.
pub fn engine_env() -> HashMap<String, String> {
    let dist = format!("{TEX_ROOT}/texmf-dist");
    let mut env = HashMap::new();
    env.insert("TEXMFCNF".to_string(), format!("{dist}/web2c"));
    env.insert("TEXMFROOT".to_string(), TEX_ROOT.to_string());
    env.insert("TEXMFDIST".to_string(), dist.clone());
    env.insert("TEXMFVAR".to_string(), format!("{dist}/texmf-var"));
    env.insert("TEXINPUTS".to_string(), format!("{dist}/tex//"));
    env.insert("T1FONTS".to_string(), format!("{dist}/fonts/type1//"));
    env.insert("ENCFONTS".to_string(), format!("{dist}/fonts/enc//"));
    env.insert("TFMFONTS".to_string(), format!("{dist}/fonts/tfm//"));
    env.insert("VFFONTS".to_string(), format!("{dist}/fonts/vf//"));
    env.insert("TEXFONTMAPS".to_string(), format!("{dist}/fonts/map//"));
    env.insert("TEXPSHEADERS".to_string(), format!("{dist}/fonts/type1//"));
    env
}
