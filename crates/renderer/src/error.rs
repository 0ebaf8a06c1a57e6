use std::fmt;
use std::path::PathBuf;

use crate::gpu::GpuError;

/// Pipeline step a shader diagnostic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStage {
    Vertex,
    Fragment,
    Link,
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileStage::Vertex => f.write_str("vertex compile"),
            CompileStage::Fragment => f.write_str("fragment compile"),
            CompileStage::Link => f.write_str("link"),
        }
    }
}

/// Failure while expanding `#include` directives.
#[derive(Debug, thiserror::Error)]
pub enum IncludeError {
    #[error("include \"{include}\" not found (looked for {})", path.display())]
    Missing { include: String, path: PathBuf },
    #[error("include \"{include}\" could not be read: {source}")]
    Unreadable {
        include: String,
        #[source]
        source: std::io::Error,
    },
    #[error("include \"{include}\" failed its standalone compile:\n{log}")]
    Invalid { include: String, log: String },
    #[error("include \"{include}\" forms a cycle: {}", chain.join(" -> "))]
    Cycle { include: String, chain: Vec<String> },
    #[error("include \"{include}\" exceeds the maximum nesting depth of {max}")]
    TooDeep { include: String, max: usize },
}

/// Structured failure returned by shader registration.
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    /// Compile or link failure; the identity now renders the default shader.
    #[error("shader '{identity}' failed at {stage}:\n{log}")]
    Compile {
        identity: String,
        stage: CompileStage,
        log: String,
    },
    /// The shader file itself could not be read; nothing was changed.
    #[error("shader '{identity}' could not be read from {}", path.display())]
    Io {
        identity: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Include expansion failed; the previously registered program is untouched.
    #[error("shader '{identity}' could not resolve its includes")]
    Include {
        identity: String,
        #[source]
        source: IncludeError,
    },
}

impl ShaderError {
    /// Compiler or include diagnostic suitable for showing to the user.
    pub fn log(&self) -> String {
        match self {
            ShaderError::Compile { log, .. } => log.clone(),
            ShaderError::Io { source, .. } => source.to_string(),
            ShaderError::Include { source, .. } => source.to_string(),
        }
    }
}

/// A uniform was written before any shader was activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("uniform set while no shader is active")]
pub struct NoActiveShader;

/// Failure of one frame step.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("no shader is active for the frame")]
    NoActiveShader,
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

impl From<NoActiveShader> for FrameError {
    fn from(_: NoActiveShader) -> Self {
        FrameError::NoActiveShader
    }
}

/// Failure while creating the built-in GPU objects of a
/// [`FrameOrchestrator`](crate::FrameOrchestrator).
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("built-in shader failed to build")]
    Shader(#[from] ShaderError),
    #[error("feedback surface allocation failed")]
    Gpu(#[from] GpuError),
}
