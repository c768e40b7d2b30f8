//! The shading-language compiler boundary.
//!
//! Compilation itself is external to this crate: a front end (slang, glslang
//! through a reflection pass, a test harness) produces SPIR-V words plus a
//! [`ProgramLayout`] tree and hands both over through [`ShaderCompiler`].
//! Diagnostics are free-form text surfaced through the error; nothing in the
//! crate parses them.

use super::layout::{ProgramLayout, ShaderStage};
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};

/// The output of a successful compile + link of one entry point.
#[derive(Clone, Debug)]
pub struct CompiledShader {
    /// SPIR-V words for the entry point.
    pub code: Vec<u32>,
    /// Reflected parameter layout of the linked program.
    pub layout: ProgramLayout,
}

/// A front end able to compile one file + entry point into SPIR-V and a
/// reflected layout tree.
pub trait ShaderCompiler {
    fn compile(
        &self,
        path: &Path,
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<CompiledShader, CompileError>;
}

/// Error produced by a shader front end.
///
/// A failed compile means a broken build, not a runtime condition; callers
/// propagate it out of startup rather than attempting recovery.
#[derive(Clone, Debug)]
pub enum CompileError {
    /// The source file could not be found or read.
    SourceNotFound(PathBuf),
    /// The requested entry point does not exist in the module.
    EntryPointNotFound { path: PathBuf, entry_point: String },
    /// The front end rejected the source; `diagnostics` is the compiler's
    /// own message text, passed through verbatim.
    Frontend { diagnostics: String },
}

impl Error for CompileError {}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::SourceNotFound(path) => {
                write!(f, "shader source `{}` could not be read", path.display())
            }
            Self::EntryPointNotFound { path, entry_point } => write!(
                f,
                "entry point `{}` not found in `{}`",
                entry_point,
                path.display(),
            ),
            Self::Frontend { diagnostics } => {
                write!(f, "shader compilation failed: {}", diagnostics)
            }
        }
    }
}
