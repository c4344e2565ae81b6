// demos/composite.rs — Host shell for the raster path.
//
// Drives the render lifecycle the way a windowing shell would, but headless:
//
//   init → resize → load_shader → step ... step → summary
//
// USAGE
// ─────
//   cargo run --example composite
//       Synthetic 1920×1080 RGB24 stream (a drifting gradient), written to
//       output/synthetic.rgb first.
//
//   cargo run --example composite -- frames.rgb --width 1920 --height 1080 --channels 3
//       Stream a raw file. Add --vertex/--fragment to load WGSL files.
//
// Snapshots land in the output directory (default output/):
// input_frame.jpg, readback.jpg (bottom-up) and readback_flipped.jpg.
//
// Set RUST_LOG=debug for per-frame timings.

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use log::{error, info};

use quadframe::error::PipelineError;
use quadframe::frame::FrameFormat;
use quadframe::gpu::device::GpuDevice;
use quadframe::{PipelineConfig, RenderSession};

const SYNTHETIC_FRAMES: usize = 8;

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), PipelineError> {
    let mut config = PipelineConfig::from_args(std::env::args().skip(1))?;
    if !config.input.exists() {
        let path = config.output_path("synthetic.rgb");
        info!("{} not found, generating {SYNTHETIC_FRAMES} synthetic frames", config.input.display());
        write_synthetic(&path, config.frame)?;
        config.input = path;
    }

    let vertex = read_shader(config.vertex_shader.as_deref())?;
    let fragment = read_shader(config.fragment_shader.as_deref())?;

    let gpu = GpuDevice::with_kind(config.device_kind)?;
    info!("{gpu}");

    let (w, h) = (config.frame.width, config.frame.height);
    let mut session = RenderSession::init(&gpu, config)?;
    session.resize(w, h)?;
    session.load_shader(vertex.as_deref(), fragment.as_deref())?;

    while let Some(out) = session.step()? {
        info!(
            "frame {}: read-back {:?}, flip {:?}",
            out.index, out.timing.readback, out.timing.flip
        );
    }
    session.log_summary();
    Ok(())
}

fn read_shader(path: Option<&Path>) -> Result<Option<String>, PipelineError> {
    path.map(|p| {
        fs::read_to_string(p).map_err(|source| PipelineError::Io {
            context: format!("reading shader {}", p.display()),
            source,
        })
    })
    .transpose()
}

/// A gradient that drifts a few pixels per frame.
fn write_synthetic(path: &Path, fmt: FrameFormat) -> Result<(), PipelineError> {
    let io = |source| PipelineError::Io { context: format!("writing {}", path.display()), source };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io)?;
    }
    let bpp = fmt.layout.bytes_per_pixel();
    let (w, h) = (fmt.width as usize, fmt.height as usize);
    let mut stream = Vec::with_capacity(fmt.frame_bytes() * SYNTHETIC_FRAMES);
    for t in 0..SYNTHETIC_FRAMES {
        for y in 0..h {
            for x in 0..w {
                let r = ((x + t * 8) * 255 / w) as u8;
                let g = (y * 255 / h) as u8;
                let b = 255 - r / 2;
                stream.extend_from_slice(&[r, g, b, 255][..bpp.min(4)]);
            }
        }
    }
    fs::write(path, stream).map_err(io)
}
