// gpu/memory.rs — Device buffers, device images and timed kernel dispatch.
//
// ORDERING CONTRACT
// ─────────────────
// Every host↔device transfer here is blocking:
//
//   upload    write → submit → wait for that submission
//   dispatch  encode → submit → returns an `Event` (no implicit wait)
//   wait      blocks on the event's submission, returns elapsed time
//   download  copy → submit → map → wait → copy out
//
// A download is only meaningful after the dispatch that wrote the buffer has
// been waited on. wgpu's queue is in-order so the copy would still observe
// the kernel's writes; the explicit `Event::wait` keeps the ordering visible
// at the call site and gives the dispatch time.
//
// STATUS CODES
// ────────────
// Failures carry the operation name and a numeric status. The codes reuse
// the compute-kernel API numbering (CL_INVALID_VALUE = -30, ...) so logs
// read the same regardless of which backend produced them.
//
// ROW ALIGNMENT
// ─────────────
// Texture copies require `bytes_per_row` to be a multiple of 256
// (`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`). Image uploads and downloads go
// through padded staging rows and are compacted on the host side.

use std::fmt;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use log::{debug, error};
use thiserror::Error;

use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::gpu::program::Kernel;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

// ---------------------------------------------------------------------------
// Status / errors
// ---------------------------------------------------------------------------

/// Numeric status of a failed device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    MemObjectAllocationFailure = -4,
    OutOfResources = -5,
    ImageFormatNotSupported = -10,
    MapFailure = -12,
    ExecStatusError = -14,
    InvalidValue = -30,
    InvalidImageSize = -40,
    InvalidKernelArgs = -52,
    InvalidWorkGroupSize = -54,
    InvalidOperation = -59,
    InvalidBufferSize = -61,
    InvalidGlobalWorkSize = -63,
}

impl Status {
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// A failed device operation. Fatal to that operation; never retried.
#[derive(Debug, Error)]
#[error("{op} failed with status {status}{}", detail_suffix(.detail))]
pub struct DispatchError {
    pub op: &'static str,
    pub status: Status,
    pub detail: Option<String>,
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default()
}

impl DispatchError {
    fn new(op: &'static str, status: Status) -> Self {
        error!("{op} failed with status {status}");
        DispatchError { op, status, detail: None }
    }

    fn with_detail(op: &'static str, status: Status, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        error!("{op} failed with status {status}: {detail}");
        DispatchError { op, status, detail: Some(detail) }
    }

    /// Map an error captured from a device scope.
    fn from_wgpu(op: &'static str, fallback: Status, e: wgpu::Error) -> Self {
        let status = match e {
            wgpu::Error::OutOfMemory { .. } => Status::MemObjectAllocationFailure,
            _ => fallback,
        };
        Self::with_detail(op, status, e.to_string())
    }
}

/// Run `f` in error scopes and turn a captured error into a `DispatchError`.
pub(crate) fn scoped<T>(
    gpu: &GpuDevice,
    op: &'static str,
    fallback: Status,
    f: impl FnOnce() -> T,
) -> Result<T, DispatchError> {
    match gpu.capture_errors(f) {
        (value, None) => Ok(value),
        (_, Some(e)) => Err(DispatchError::from_wgpu(op, fallback, e)),
    }
}

// ---------------------------------------------------------------------------
// Access mode
// ---------------------------------------------------------------------------

/// How kernels access a buffer or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

// ---------------------------------------------------------------------------
// DeviceBuffer
// ---------------------------------------------------------------------------

/// A 1D device buffer usable as a kernel storage argument.
pub struct DeviceBuffer {
    pub(crate) buffer: wgpu::Buffer,
    size: u64,
    mode: AccessMode,
}

impl DeviceBuffer {
    /// Allocate `byte_size` bytes of device memory.
    ///
    /// # Errors
    /// `InvalidBufferSize` for a zero size, a size that is not a multiple of
    /// 4, or one above the device's storage binding limit.
    pub fn allocate(gpu: &GpuDevice, mode: AccessMode, byte_size: u64) -> Result<Self, DispatchError> {
        const OP: &str = "allocate";
        let max = gpu.limits.max_storage_buffer_binding_size as u64;
        if byte_size == 0 || byte_size % 4 != 0 || byte_size > max {
            return Err(DispatchError::with_detail(
                OP,
                Status::InvalidBufferSize,
                format!("{byte_size} bytes (limit {max}, must be a non-zero multiple of 4)"),
            ));
        }
        let buffer = scoped(gpu, OP, Status::OutOfResources, || {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("DeviceBuffer"),
                size: byte_size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        })?;
        Ok(DeviceBuffer { buffer, size: byte_size, mode })
    }

    /// Allocate a buffer sized for `data` and upload it.
    pub fn from_slice<T: bytemuck::Pod>(
        gpu: &GpuDevice,
        mode: AccessMode,
        data: &[T],
    ) -> Result<Self, DispatchError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buf = Self::allocate(gpu, mode, bytes.len() as u64)?;
        buf.upload(gpu, bytes)?;
        Ok(buf)
    }

    /// Typed `upload`.
    pub fn upload_slice<T: bytemuck::Pod>(&self, gpu: &GpuDevice, data: &[T]) -> Result<(), DispatchError> {
        self.upload(gpu, bytemuck::cast_slice(data))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Blocking host → device copy of the whole buffer.
    pub fn upload(&self, gpu: &GpuDevice, data: &[u8]) -> Result<(), DispatchError> {
        const OP: &str = "upload";
        if data.len() as u64 != self.size {
            return Err(DispatchError::with_detail(
                OP,
                Status::InvalidValue,
                format!("host data is {} bytes, buffer is {}", data.len(), self.size),
            ));
        }
        scoped(gpu, OP, Status::InvalidOperation, || {
            gpu.queue.write_buffer(&self.buffer, 0, data);
            let idx = gpu.queue.submit(std::iter::empty());
            gpu.device.poll(wgpu::Maintain::WaitForSubmissionIndex(idx));
        })
    }

    /// Blocking device → host copy of the whole buffer.
    ///
    /// Call after waiting on the dispatch that wrote this buffer.
    pub fn download(&self, gpu: &GpuDevice, out: &mut [u8]) -> Result<(), DispatchError> {
        const OP: &str = "download";
        if out.len() as u64 != self.size {
            return Err(DispatchError::with_detail(
                OP,
                Status::InvalidValue,
                format!("host buffer is {} bytes, device buffer is {}", out.len(), self.size),
            ));
        }
        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DeviceBuffer::download"),
            size: self.size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(OP) });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, self.size);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        map_read(gpu, OP, &staging, |mapped| out.copy_from_slice(mapped))
    }

    /// Download and reinterpret as `T`.
    pub fn download_vec<T: bytemuck::Pod>(&self, gpu: &GpuDevice) -> Result<Vec<T>, DispatchError> {
        let count = self.size as usize / std::mem::size_of::<T>();
        let mut out = vec![T::zeroed(); count];
        self.download(gpu, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// DeviceImage
// ---------------------------------------------------------------------------

/// Texel formats of device images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// One unsigned 8-bit channel. Read-only images only.
    R8Uint,
    /// Four unsigned 8-bit channels.
    Rgba8Uint,
    /// One unsigned 32-bit channel.
    R32Uint,
    /// One 32-bit float channel.
    R32Float,
}

impl ImageFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            ImageFormat::R8Uint => 1,
            ImageFormat::Rgba8Uint | ImageFormat::R32Uint | ImageFormat::R32Float => 4,
        }
    }

    fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            ImageFormat::R8Uint => wgpu::TextureFormat::R8Uint,
            ImageFormat::Rgba8Uint => wgpu::TextureFormat::Rgba8Uint,
            ImageFormat::R32Uint => wgpu::TextureFormat::R32Uint,
            ImageFormat::R32Float => wgpu::TextureFormat::R32Float,
        }
    }

    /// Whether kernels may write this format through a storage binding.
    pub fn supports_storage(self) -> bool {
        !matches!(self, ImageFormat::R8Uint)
    }
}

/// A 2D device image.
///
/// `ReadOnly` images are bound as `texture_2d`, `WriteOnly` images as
/// `texture_storage_2d<_, write>`.
pub struct DeviceImage {
    pub(crate) texture: wgpu::Texture,
    pub(crate) view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    mode: AccessMode,
}

impl DeviceImage {
    /// Create an image, optionally initialised from `host` (tightly packed
    /// rows, `width × height × bytes_per_texel` bytes).
    pub fn create(
        gpu: &GpuDevice,
        mode: AccessMode,
        format: ImageFormat,
        width: u32,
        height: u32,
        host: Option<&[u8]>,
    ) -> Result<Self, DispatchError> {
        const OP: &str = "create_image";
        let max = gpu.limits.max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(DispatchError::with_detail(
                OP,
                Status::InvalidImageSize,
                format!("{width}×{height} (limit {max})"),
            ));
        }
        let usage = match mode {
            AccessMode::ReadOnly => {
                wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC
            }
            AccessMode::WriteOnly => {
                if !format.supports_storage() {
                    return Err(DispatchError::with_detail(
                        OP,
                        Status::ImageFormatNotSupported,
                        format!("{format:?} cannot be a write-only image"),
                    ));
                }
                wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST
            }
            AccessMode::ReadWrite => {
                return Err(DispatchError::with_detail(
                    OP,
                    Status::InvalidValue,
                    "read-write images are not supported",
                ));
            }
        };

        let texture = scoped(gpu, OP, Status::OutOfResources, || {
            gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("DeviceImage"),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: format.texture_format(),
                usage,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let image = DeviceImage { texture, view, width, height, format, mode };

        if let Some(data) = host {
            image.upload(gpu, data)?;
        }
        Ok(image)
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Bytes of one tightly packed row.
    pub fn row_bytes(&self) -> u32 {
        self.width * self.format.bytes_per_texel()
    }

    /// Bytes of the whole tightly packed image.
    pub fn byte_size(&self) -> usize {
        self.row_bytes() as usize * self.height as usize
    }

    /// Blocking host → device copy of the full region.
    pub fn upload(&self, gpu: &GpuDevice, data: &[u8]) -> Result<(), DispatchError> {
        const OP: &str = "write_image";
        if data.len() != self.byte_size() {
            return Err(DispatchError::with_detail(
                OP,
                Status::InvalidValue,
                format!("host data is {} bytes, image is {}", data.len(), self.byte_size()),
            ));
        }
        scoped(gpu, OP, Status::InvalidOperation, || {
            gpu.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &self.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.row_bytes()),
                    rows_per_image: Some(self.height),
                },
                self.extent(),
            );
            let idx = gpu.queue.submit(std::iter::empty());
            gpu.device.poll(wgpu::Maintain::WaitForSubmissionIndex(idx));
        })
    }

    /// Blocking device → host copy of origin {0,0,0}, region
    /// {width, height, 1}. Rows are written tightly packed.
    pub fn download(&self, gpu: &GpuDevice, out: &mut [u8]) -> Result<(), DispatchError> {
        const OP: &str = "read_image";
        if out.len() != self.byte_size() {
            return Err(DispatchError::with_detail(
                OP,
                Status::InvalidValue,
                format!("host buffer is {} bytes, image is {}", out.len(), self.byte_size()),
            ));
        }
        let row = self.row_bytes() as usize;
        let padded = align_to(self.row_bytes(), COPY_ALIGNMENT);
        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DeviceImage::download"),
            size: padded as u64 * self.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(OP) });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(self.height),
                },
            },
            self.extent(),
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        map_read(gpu, OP, &staging, |mapped| {
            for (dst, src) in out.chunks_exact_mut(row).zip(mapped.chunks(padded as usize)) {
                dst.copy_from_slice(&src[..row]);
            }
        })
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// One kernel argument. Argument `i` binds to `@binding(i)`.
pub enum KernelArg<'a> {
    Buffer(&'a DeviceBuffer),
    Image(&'a DeviceImage),
    U32(u32),
    F32(f32),
}

/// The global work size of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalSize {
    /// `n` work items, rounded up to a multiple of the workgroup size. The
    /// kernel must guard indices ≥ n.
    Linear(u32),
    /// Exactly `width × height` work items; the workgroup tile must divide
    /// both dimensions.
    Image { width: u32, height: u32 },
}

impl GlobalSize {
    /// Number of workgroups along x and y for the given tile.
    pub fn workgroups(&self, ws: WorkgroupSize) -> Result<(u32, u32), DispatchError> {
        const OP: &str = "dispatch";
        match *self {
            GlobalSize::Linear(0) | GlobalSize::Image { width: 0, .. } | GlobalSize::Image { height: 0, .. } => {
                Err(DispatchError::new(OP, Status::InvalidGlobalWorkSize))
            }
            GlobalSize::Linear(n) => {
                if ws.y != 1 {
                    return Err(DispatchError::with_detail(
                        OP,
                        Status::InvalidWorkGroupSize,
                        format!("linear dispatch with 2D tile {ws}"),
                    ));
                }
                let rounded = round_up(n, ws.x).ok_or_else(|| {
                    DispatchError::with_detail(
                        OP,
                        Status::InvalidGlobalWorkSize,
                        format!("{n} work items overflow when rounded up to {}", ws.x),
                    )
                })?;
                Ok((rounded / ws.x, 1))
            }
            GlobalSize::Image { width, height } => {
                if width % ws.x != 0 || height % ws.y != 0 {
                    return Err(DispatchError::with_detail(
                        OP,
                        Status::InvalidWorkGroupSize,
                        format!("tile {ws} does not divide {width}×{height}"),
                    ));
                }
                Ok((width / ws.x, height / ws.y))
            }
        }
    }
}

/// Completion handle of one dispatch.
#[must_use = "wait on the event before reading results back"]
pub struct Event {
    submission: wgpu::SubmissionIndex,
    done: mpsc::Receiver<()>,
    started: Instant,
    kernel: String,
}

impl Event {
    /// Block until the dispatch has completed; returns the time from
    /// submission to completion.
    ///
    /// # Errors
    /// `ExecStatusError` if the poll returns without the submission's
    /// work-done signal (lost device).
    pub fn wait(self, gpu: &GpuDevice) -> Result<Duration, DispatchError> {
        gpu.device.poll(wgpu::Maintain::WaitForSubmissionIndex(self.submission));
        let elapsed = self.started.elapsed();
        if self.done.try_recv().is_err() {
            return Err(DispatchError::with_detail(
                "wait",
                Status::ExecStatusError,
                format!("kernel '{}' did not complete", self.kernel),
            ));
        }
        debug!("kernel '{}' completed in {:.3} ms", self.kernel, elapsed.as_secs_f64() * 1e3);
        Ok(elapsed)
    }
}

/// Bind `args`, dispatch `kernel` over `global` and return its event.
pub fn dispatch(
    gpu: &GpuDevice,
    kernel: &Kernel,
    args: &[KernelArg<'_>],
    global: GlobalSize,
) -> Result<Event, DispatchError> {
    const OP: &str = "dispatch";
    let (groups_x, groups_y) = global.workgroups(kernel.workgroup)?;
    let max_groups = gpu.limits.max_compute_workgroups_per_dimension;
    if groups_x > max_groups || groups_y > max_groups {
        return Err(DispatchError::with_detail(
            OP,
            Status::InvalidGlobalWorkSize,
            format!("{groups_x}×{groups_y} workgroups exceeds {max_groups} per dimension"),
        ));
    }

    // Scalars travel in small uniform buffers, padded to 16 bytes.
    let scalars: Vec<Option<wgpu::Buffer>> = args
        .iter()
        .map(|arg| {
            let word = match arg {
                KernelArg::U32(v) => v.to_le_bytes(),
                KernelArg::F32(v) => v.to_le_bytes(),
                _ => return None,
            };
            let mut bytes = [0u8; 16];
            bytes[..4].copy_from_slice(&word);
            Some(wgpu::util::DeviceExt::create_buffer_init(
                &gpu.device,
                &wgpu::util::BufferInitDescriptor {
                    label: Some("kernel scalar"),
                    contents: &bytes,
                    usage: wgpu::BufferUsages::UNIFORM,
                },
            ))
        })
        .collect();

    let mut entries = Vec::with_capacity(args.len());
    for (i, (arg, scalar)) in args.iter().zip(&scalars).enumerate() {
        let resource = match (arg, scalar) {
            (KernelArg::Buffer(b), _) => b.buffer.as_entire_binding(),
            (KernelArg::Image(img), _) => wgpu::BindingResource::TextureView(&img.view),
            (_, Some(s)) => s.as_entire_binding(),
            (_, None) => return Err(DispatchError::new("set_kernel_args", Status::InvalidKernelArgs)),
        };
        entries.push(wgpu::BindGroupEntry { binding: i as u32, resource });
    }

    let bind_group = scoped(gpu, "set_kernel_args", Status::InvalidKernelArgs, || {
        gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel args"),
            layout: &kernel.bind_group_layout,
            entries: &entries,
        })
    })?;

    let started = Instant::now();
    let submission = scoped(gpu, OP, Status::InvalidOperation, || {
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(kernel.name.as_str()) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()))
    })?;
    let (signal, done) = mpsc::channel();
    gpu.queue.on_submitted_work_done(move || {
        let _ = signal.send(());
    });

    debug!(
        "dispatched '{}' as {groups_x}×{groups_y} groups of {}",
        kernel.name, kernel.workgroup
    );
    Ok(Event { submission, done, started, kernel: kernel.name.clone() })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map `staging` for reading, block until mapped, hand the bytes to `f`.
pub(crate) fn map_read(
    gpu: &GpuDevice,
    op: &'static str,
    staging: &wgpu::Buffer,
    f: impl FnOnce(&[u8]),
) -> Result<(), DispatchError> {
    let slice = staging.slice(..);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        // The receiver lives until after the poll below.
        let _ = sender.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    match receiver.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(DispatchError::with_detail(op, Status::MapFailure, e.to_string())),
        Err(_) => {
            return Err(DispatchError::with_detail(op, Status::MapFailure, "map callback never fired"))
        }
    }
    {
        let mapped = slice.get_mapped_range();
        f(&mapped);
    }
    staging.unmap();
    Ok(())
}

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// `n` rounded up to a multiple of `multiple`; `None` on overflow.
#[inline]
fn round_up(n: u32, multiple: u32) -> Option<u32> {
    n.div_ceil(multiple).checked_mul(multiple)
}
