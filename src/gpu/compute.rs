// gpu/compute.rs — Drivers for the built-in kernels.
//
// Each driver runs the full compute-kernel lifecycle for one kernel:
//
//   registry source → KernelProgram::build → resolve_kernel
//     → allocate + upload → dispatch → Event::wait → download
//
// and returns the host result together with the dispatch time.

use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::gpu::kernels::KernelRegistry;
use crate::gpu::memory::{
    dispatch, AccessMode, DeviceBuffer, DeviceImage, DispatchError, GlobalSize, ImageFormat, KernelArg,
};
use crate::gpu::program::{BuildError, BuildOptions, Kernel, KernelProgram};

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("invalid kernel input: {0}")]
    InvalidInput(String),
}

/// Host output of one kernel run.
#[derive(Debug, Clone)]
pub struct KernelRun<T> {
    pub output: T,
    /// Submission to completion of the dispatch.
    pub elapsed: Duration,
}

fn resolve(
    gpu: &GpuDevice,
    registry: &KernelRegistry,
    name: &str,
    workgroup: WorkgroupSize,
) -> Result<Kernel, BuildError> {
    let program = KernelProgram::from_registry(gpu, registry, name, &BuildOptions { workgroup })?;
    program.resolve_kernel(gpu, name)
}

/// `c[i] = a[i] * b[i]` for `i < a.len()`.
///
/// The output buffer starts as `c_init`, which may be longer than the
/// inputs; elements at and beyond `a.len()` are left as they were.
pub fn run_vec_mul(
    gpu: &GpuDevice,
    registry: &KernelRegistry,
    a: &[f32],
    b: &[f32],
    c_init: &[f32],
) -> Result<KernelRun<Vec<f32>>, ComputeError> {
    let n = a.len();
    if b.len() != n || c_init.len() < n {
        return Err(ComputeError::InvalidInput(format!(
            "vec_mul needs |a| == |b| <= |c| (got {}, {}, {})",
            n,
            b.len(),
            c_init.len()
        )));
    }
    let kernel = resolve(gpu, registry, KernelRegistry::VEC_MUL, WorkgroupSize::linear())?;

    let d_a = DeviceBuffer::from_slice(gpu, AccessMode::ReadOnly, a)?;
    let d_b = DeviceBuffer::from_slice(gpu, AccessMode::ReadOnly, b)?;
    let d_c = DeviceBuffer::from_slice(gpu, AccessMode::WriteOnly, c_init)?;

    let event = dispatch(
        gpu,
        &kernel,
        &[KernelArg::Buffer(&d_a), KernelArg::Buffer(&d_b), KernelArg::Buffer(&d_c), KernelArg::U32(n as u32)],
        GlobalSize::Linear(n as u32),
    )?;
    let elapsed = event.wait(gpu)?;
    let output = d_c.download_vec::<f32>(gpu)?;
    info!("vec_mul n={n}: {} µs", elapsed.as_micros());
    Ok(KernelRun { output, elapsed })
}

/// `C = alpha * A + B`.
pub fn run_saxpy(
    gpu: &GpuDevice,
    registry: &KernelRegistry,
    alpha: f32,
    a: &[f32],
    b: &[f32],
) -> Result<KernelRun<Vec<f32>>, ComputeError> {
    if a.len() != b.len() {
        return Err(ComputeError::InvalidInput(format!(
            "saxpy needs |A| == |B| (got {}, {})",
            a.len(),
            b.len()
        )));
    }
    let kernel = resolve(gpu, registry, KernelRegistry::SAXPY, WorkgroupSize::linear())?;

    let d_a = DeviceBuffer::from_slice(gpu, AccessMode::ReadOnly, a)?;
    let d_b = DeviceBuffer::from_slice(gpu, AccessMode::ReadOnly, b)?;
    let d_c = DeviceBuffer::allocate(gpu, AccessMode::WriteOnly, std::mem::size_of_val(a) as u64)?;

    let event = dispatch(
        gpu,
        &kernel,
        &[KernelArg::F32(alpha), KernelArg::Buffer(&d_a), KernelArg::Buffer(&d_b), KernelArg::Buffer(&d_c)],
        GlobalSize::Linear(a.len() as u32),
    )?;
    let elapsed = event.wait(gpu)?;
    let output = d_c.download_vec::<f32>(gpu)?;
    info!("saxpy n={} alpha={alpha}: {} µs", a.len(), elapsed.as_micros());
    Ok(KernelRun { output, elapsed })
}

/// Copy a single-channel 8-bit plane through `image2d_copy`.
///
/// The plane is packed four pixels per `rgba8uint` texel, so `width` must
/// be a multiple of 4. The copy covers exactly `width/4 × height` texels.
pub fn run_image_copy(
    gpu: &GpuDevice,
    registry: &KernelRegistry,
    plane: &[u8],
    width: u32,
    height: u32,
) -> Result<KernelRun<Vec<u8>>, ComputeError> {
    if width == 0 || height == 0 || width % 4 != 0 {
        return Err(ComputeError::InvalidInput(format!(
            "plane width must be a non-zero multiple of 4 (got {width}×{height})"
        )));
    }
    if plane.len() != width as usize * height as usize {
        return Err(ComputeError::InvalidInput(format!(
            "plane is {} bytes, expected {width}×{height}",
            plane.len()
        )));
    }
    let texels_x = width / 4;
    let tile = WorkgroupSize::exact_tile(texels_x, height);
    let kernel = resolve(gpu, registry, KernelRegistry::IMAGE2D_COPY, tile)?;

    let input = DeviceImage::create(
        gpu,
        AccessMode::ReadOnly,
        ImageFormat::Rgba8Uint,
        texels_x,
        height,
        Some(plane),
    )?;
    let output =
        DeviceImage::create(gpu, AccessMode::WriteOnly, ImageFormat::Rgba8Uint, texels_x, height, None)?;

    let event = dispatch(
        gpu,
        &kernel,
        &[KernelArg::Image(&input), KernelArg::Image(&output)],
        GlobalSize::Image { width: texels_x, height },
    )?;
    let elapsed = event.wait(gpu)?;

    let mut host = vec![0u8; output.byte_size()];
    output.download(gpu, &mut host)?;
    info!("image2d_copy {width}×{height} (tile {tile}): {} µs", elapsed.as_micros());
    Ok(KernelRun { output: host, elapsed })
}
