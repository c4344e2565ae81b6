// error.rs — Crate-level error aggregate.
//
// Each module keeps its own error enum; `PipelineError` collects them for
// the session and the demo programs.

use thiserror::Error;

use crate::config::ConfigError;
use crate::gpu::compositor::{CompileError, CompositorError};
use crate::gpu::compute::ComputeError;
use crate::gpu::device::SetupError;
use crate::gpu::memory::DispatchError;
use crate::gpu::program::BuildError;
use crate::post::PostError;
use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("setup: {0}")]
    Setup(#[from] SetupError),
    #[error("build: {0}")]
    Build(#[from] BuildError),
    #[error("shader: {0}")]
    Compile(#[from] CompileError),
    #[error("compositor: {0}")]
    Compositor(#[from] CompositorError),
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("compute: {0}")]
    Compute(#[from] ComputeError),
    #[error("frame source: {0}")]
    Source(#[from] SourceError),
    #[error("post-processing: {0}")]
    Post(#[from] PostError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
