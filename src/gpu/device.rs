// gpu/device.rs — Compute context: platform, device, context and queue.
//
// Responsibilities:
//   - Enumerate platforms (wgpu backends that expose at least one adapter)
//     and fail with `NoPlatform` when there are none.
//   - On the first platform, pick the first adapter of the requested
//     `DeviceKind` and fail with `NoDevice` when it has none.
//   - Create one device and its in-order queue.
//   - Log the device capabilities. These are diagnostics only; nothing
//     downstream is gated on them.
//   - Provide `WorkgroupSize`, the per-kernel tile that is substituted into
//     kernel sources at build time.
//
// PLATFORM ORDER:
// `enumerate_adapters(Backends::all())` returns adapters grouped by
// backend in wgpu's fixed backend order (Vulkan, Metal, DX12, GL). The
// "first platform" is the backend of the first adapter in that list, so a
// machine with both Vulkan and GL drivers selects Vulkan.
//
// ERROR SCOPES:
// wgpu reports validation and out-of-memory errors asynchronously through
// error scopes. `capture_errors` pushes both scopes around a closure and
// pops them synchronously via `pollster::block_on`, turning a device-side
// failure into a value the caller can map onto a status code.

use std::fmt;

use log::{debug, info};
use thiserror::Error;

/// Which kind of device to request from the first platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Hardware GPU: discrete, integrated or virtualised.
    Gpu,
    /// Software rasteriser / CPU implementation.
    Cpu,
    /// Anything the platform reports as "other" (e.g. translation layers).
    Other,
    /// First adapter of the platform, whatever its type.
    Any,
}

impl DeviceKind {
    fn matches(self, ty: wgpu::DeviceType) -> bool {
        match self {
            DeviceKind::Gpu => matches!(
                ty,
                wgpu::DeviceType::DiscreteGpu
                    | wgpu::DeviceType::IntegratedGpu
                    | wgpu::DeviceType::VirtualGpu
            ),
            DeviceKind::Cpu => ty == wgpu::DeviceType::Cpu,
            DeviceKind::Other => ty == wgpu::DeviceType::Other,
            DeviceKind::Any => true,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Gpu => write!(f, "GPU"),
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Other => write!(f, "other"),
            DeviceKind::Any => write!(f, "any"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceKind::Gpu),
            "cpu" => Ok(DeviceKind::Cpu),
            "other" => Ok(DeviceKind::Other),
            "any" | "default" | "all" => Ok(DeviceKind::Any),
            other => Err(format!("unknown device kind '{other}' (gpu, cpu, other, any)")),
        }
    }
}

/// A 2D workgroup tile. 1D kernels use `y == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Work items per group for buffer kernels.
    pub const LOCAL_SIZE: u32 = 64;

    /// The fixed 64 × 1 tile of buffer kernels.
    pub const fn linear() -> Self {
        WorkgroupSize { x: Self::LOCAL_SIZE, y: 1 }
    }

    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Largest power-of-two tile (at most 16 × 16) that divides both image
    /// dimensions exactly, so a dispatch covers exactly `width × height`
    /// work items with no rounding.
    pub fn exact_tile(width: u32, height: u32) -> Self {
        WorkgroupSize { x: largest_pow2_divisor(width, 16), y: largest_pow2_divisor(height, 16) }
    }

    /// Placeholder substitutions for kernel sources.
    ///
    /// ```wgsl
    /// @compute @workgroup_size({{WG_X}}, {{WG_Y}}, 1)
    /// fn main(...) { ... }
    /// ```
    pub fn substitutions(&self) -> [(&'static str, String); 2] {
        [("{{WG_X}}", self.x.to_string()), ("{{WG_Y}}", self.y.to_string())]
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

fn largest_pow2_divisor(value: u32, cap: u32) -> u32 {
    let mut d = cap;
    while d > 1 && value % d != 0 {
        d /= 2;
    }
    d.max(1)
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub driver: String,
    pub driver_info: String,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The compute context: selected platform and device, plus the device's
/// queue.
///
/// Hold one `GpuDevice` for the whole session. Every buffer, image,
/// program and compositor operation borrows it, so none of them can
/// outlive it.
///
/// # Field drop order
/// Fields drop top to bottom. `_instance` is declared last so the
/// `wgpu::Instance` outlives the device and its queue.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub kind: DeviceKind,
    pub limits: wgpu::Limits,
    _adapter: wgpu::Adapter,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a context on the first GPU of the first platform.
    pub fn new() -> Result<Self, SetupError> {
        Self::with_kind(DeviceKind::Gpu)
    }

    /// Create a context on the first device of `kind` on the first
    /// platform.
    ///
    /// # Errors
    /// `NoPlatform` if no backend exposes an adapter, `NoDevice` if the
    /// first platform has no adapter of `kind`, `ContextCreationFailed` if
    /// the device request is rejected.
    pub fn with_kind(kind: DeviceKind) -> Result<Self, SetupError> {
        pollster::block_on(Self::init_async(kind))
    }

    async fn init_async(kind: DeviceKind) -> Result<Self, SetupError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        info!("platforms: {} adapter(s) visible", adapters.len());
        for a in &adapters {
            let i = a.get_info();
            debug!("  adapter: {} ({:?}, {:?})", i.name, i.backend, i.device_type);
        }

        let platform = adapters
            .first()
            .map(|a| a.get_info().backend)
            .ok_or(SetupError::NoPlatform)?;

        let adapter = adapters
            .into_iter()
            .filter(|a| a.get_info().backend == platform)
            .find(|a| kind.matches(a.get_info().device_type))
            .ok_or(SetupError::NoDevice { kind, platform })?;

        let raw = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw.name.clone(),
            vendor: raw.vendor,
            device: raw.device,
            device_type: raw.device_type,
            driver: raw.driver.clone(),
            driver_info: raw.driver_info.clone(),
            backend: raw.backend,
        };

        // Ask for what the adapter offers so large frames fit; this is the
        // device's own limit set, never above it.
        let limits = adapter.limits();

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("quadframe"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(SetupError::ContextCreationFailed)?;

        let gpu = GpuDevice {
            device,
            queue,
            adapter_info,
            kind,
            limits,
            _adapter: adapter,
            _instance: instance,
        };
        gpu.log_capabilities();
        Ok(gpu)
    }

    fn log_capabilities(&self) {
        let i = &self.adapter_info;
        let l = &self.limits;
        info!("device name: {}", i.name);
        info!("device type: {:?} on {:?}", i.device_type, i.backend);
        info!("device vendor: {:#06x} id: {:#06x}", i.vendor, i.device);
        info!("device driver: {} {}", i.driver, i.driver_info);
        info!(
            "max workgroup size: {}×{}×{}, max invocations: {}",
            l.max_compute_workgroup_size_x,
            l.max_compute_workgroup_size_y,
            l.max_compute_workgroup_size_z,
            l.max_compute_invocations_per_workgroup
        );
        info!("local (workgroup) memory: {} bytes", l.max_compute_workgroup_storage_size);
        info!(
            "max buffer size: {} bytes, max storage binding: {} bytes",
            l.max_buffer_size, l.max_storage_buffer_binding_size
        );
        info!("max 2D texture dimension: {}", l.max_texture_dimension_2d);
    }

    /// Run `f` inside validation and out-of-memory error scopes and return
    /// its value together with the first error raised, if any.
    pub fn capture_errors<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(oom))
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {}, kind: {} }}", self.adapter_info, self.kind)
    }
}

// ============================================================
// Error type
// ============================================================

/// Setup failures: fatal to the path that needed the context.
#[derive(Debug, Error)]
pub enum SetupError {
    /// No backend exposes any adapter.
    #[error("no compute platform available (no wgpu backend exposes an adapter)")]
    NoPlatform,
    /// The first platform has no adapter of the requested kind.
    #[error("no {kind} device on platform {platform:?}")]
    NoDevice { kind: DeviceKind, platform: wgpu::Backend },
    /// The device request was rejected.
    #[error("context creation failed: {0}")]
    ContextCreationFailed(#[source] wgpu::RequestDeviceError),
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that need an adapter are `#[ignore]`d so `cargo test` passes on
    // machines without one. Run them with `cargo test -- --include-ignored`.

    #[test]
    fn test_linear_workgroup() {
        let ws = WorkgroupSize::linear();
        assert_eq!(ws, WorkgroupSize { x: 64, y: 1 });
        assert_eq!(ws.total(), 64);
    }

    #[test]
    fn test_exact_tile_divides() {
        // 1440 = 16 × 90, 1080 = 8 × 135.
        assert_eq!(WorkgroupSize::exact_tile(1440, 1080), WorkgroupSize { x: 16, y: 8 });
        // Odd dimensions fall back to a 1-wide tile.
        assert_eq!(WorkgroupSize::exact_tile(7, 12), WorkgroupSize { x: 1, y: 4 });
        assert_eq!(WorkgroupSize::exact_tile(360, 1080).x, 8);
    }

    #[test]
    fn test_substitutions() {
        let subs = WorkgroupSize { x: 16, y: 8 }.substitutions();
        assert_eq!(subs[0], ("{{WG_X}}", "16".to_string()));
        assert_eq!(subs[1], ("{{WG_Y}}", "8".to_string()));
    }

    #[test]
    fn test_device_kind_matching() {
        assert!(DeviceKind::Gpu.matches(wgpu::DeviceType::DiscreteGpu));
        assert!(DeviceKind::Gpu.matches(wgpu::DeviceType::IntegratedGpu));
        assert!(!DeviceKind::Gpu.matches(wgpu::DeviceType::Cpu));
        assert!(DeviceKind::Cpu.matches(wgpu::DeviceType::Cpu));
        assert!(DeviceKind::Any.matches(wgpu::DeviceType::Other));
    }

    #[test]
    fn test_device_kind_parse() {
        assert_eq!("GPU".parse::<DeviceKind>(), Ok(DeviceKind::Gpu));
        assert_eq!("any".parse::<DeviceKind>(), Ok(DeviceKind::Any));
        assert!("fpga".parse::<DeviceKind>().is_err());
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_device_init() {
        let gpu = GpuDevice::with_kind(DeviceKind::Any).expect("should create a context");
        println!("{gpu}");
        assert!(gpu.limits.max_compute_invocations_per_workgroup >= 64);
    }
}
