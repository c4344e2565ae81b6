// demos/compute_copy.rs — The compute-kernel path end to end.
//
//   1. vec_mul over 10 elements into a 64-element output
//   2. saxpy with alpha = 1, B = 0 (reproduces A)
//   3. image2d_copy of a 1440×1080 Y plane, written as image_copy.yuv
//
// USAGE
// ─────
//   cargo run --example compute_copy
//   cargo run --example compute_copy -- --compute-input plane.yuv --device any
//
// Without --compute-input a synthetic luma ramp is copied.

use std::fs;
use std::process::ExitCode;

use log::{error, info, warn};

use quadframe::error::PipelineError;
use quadframe::frame::{FrameBuffer, FrameFormat, PixelLayout};
use quadframe::gpu::compute::{run_image_copy, run_saxpy, run_vec_mul};
use quadframe::gpu::device::GpuDevice;
use quadframe::gpu::kernels::KernelRegistry;
use quadframe::post;
use quadframe::source::FrameSource;
use quadframe::PipelineConfig;

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
    let config = PipelineConfig::from_args(std::env::args().skip(1))?;
    let gpu = GpuDevice::with_kind(config.device_kind)?;
    info!("{gpu}");
    let registry = KernelRegistry::builtin();

    // --- vec_mul ---
    let a: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let run = run_vec_mul(&gpu, &registry, &a, &a, &[0.0; 64])?;
    info!("vec_mul c[0..10] = {:?} ({} µs)", &run.output[..10], run.elapsed.as_micros());

    // --- saxpy ---
    let run = run_saxpy(&gpu, &registry, 1.0, &a, &[0.0; 10])?;
    if run.output != a {
        warn!("saxpy identity mismatch: {:?}", run.output);
    }
    info!("saxpy C = {:?} ({} µs)", run.output, run.elapsed.as_micros());

    // --- image2d_copy ---
    let (w, h) = (config.compute.image_width, config.compute.image_height);
    let fmt = FrameFormat::new(w, h, PixelLayout::Gray8);
    let mut plane = FrameBuffer::new(fmt);
    match &config.compute.input {
        Some(path) => {
            let mut src = FrameSource::open(path, fmt.frame_bytes())?;
            if !src.read_next_frame(&mut plane)? {
                warn!("{} holds no full {fmt} plane, copying zeros", path.display());
            }
        }
        None => {
            for (i, px) in plane.as_mut_slice().iter_mut().enumerate() {
                *px = ((i % w as usize) * 255 / w as usize) as u8;
            }
        }
    }

    let run = run_image_copy(&gpu, &registry, plane.as_slice(), w, h)?;
    let identical = run.output == plane.as_slice();
    info!(
        "image2d_copy {w}×{h}: {} µs, output {} input",
        run.elapsed.as_micros(),
        if identical { "matches" } else { "differs from" }
    );

    fs::create_dir_all(&config.output_dir).map_err(|source| PipelineError::Io {
        context: format!("creating {}", config.output_dir.display()),
        source,
    })?;
    post::write_raw(&run.output, &config.output_path(&config.compute.output))?;
    Ok(())
}
