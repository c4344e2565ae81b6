// gpu/mod.rs — wgpu layer: compute-kernel path and shader compositor.
//
// Two execution models share one `GpuDevice`:
//
//   compute   kernels → program → kernel → buffers/images → dispatch → event
//   raster    shader program → four texture units → draw → read-back
//
// Every device operation blocks or returns an event that the caller waits
// on. Host code never observes device memory that has not been synchronised.

pub mod compiler;
pub mod compositor;
pub mod compute;
pub mod device;
pub mod kernels;
pub mod memory;
pub mod program;
