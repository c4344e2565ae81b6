// quadframe: dual-path GPU frame pipeline
//
// Raw frames stream from storage into four texture units, are composited by
// a fragment shader and read back to the host. A compute-kernel path runs
// the same kind of copy through explicit program, kernel and device-memory
// objects with timed dispatch.

pub mod config;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod post;
pub mod session;
pub mod source;

pub use config::{ComputeConfig, PipelineConfig};
pub use error::PipelineError;
pub use frame::{FrameBuffer, FrameFormat, PixelLayout};
pub use session::RenderSession;
pub use source::FrameSource;
