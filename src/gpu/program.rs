// gpu/program.rs — Build kernel programs and resolve kernel entry points.
//
// A `KernelProgram` is one WGSL module built for one workgroup tile:
//
//   fragments ──concat──▶ source ──{{WG_X}},{{WG_Y}}──▶ specialised source
//             ──naga parse+validate──▶ module ──device──▶ wgpu::ShaderModule
//
// Any failure along that chain is a `BuildFailed` carrying the full log and
// no program is returned. Kernels are the module's `@compute` entry points;
// `resolve_kernel` turns one into a compute pipeline (layout derived from
// the shader, so argument bindings follow the source declarations).

use log::{debug, error};
use thiserror::Error;

use crate::gpu::compiler::{self, CheckedModule};
use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::gpu::kernels::KernelRegistry;

/// Options applied to a program at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub workgroup: WorkgroupSize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions { workgroup: WorkgroupSize::linear() }
    }
}

/// Program build and kernel lookup failures.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("program build failed:\n{log}")]
    BuildFailed { log: String },
    #[error("kernel '{name}' not found in program (available: {available:?})")]
    SymbolNotFound { name: String, available: Vec<String> },
    #[error("no kernel source registered under '{0}'")]
    UnknownSource(String),
}

/// A built program: one shader module and its compute entry points.
pub struct KernelProgram {
    module: wgpu::ShaderModule,
    kernel_names: Vec<String>,
    options: BuildOptions,
    label: String,
}

impl KernelProgram {
    /// Concatenate `fragments`, specialise them with `options` and build.
    pub fn build(
        gpu: &GpuDevice,
        label: &str,
        fragments: &[&str],
        options: &BuildOptions,
    ) -> Result<Self, BuildError> {
        let mut source = fragments.concat();
        for (key, value) in options.workgroup.substitutions() {
            source = source.replace(key, &value);
        }

        let checked = compiler::check_wgsl(&source).map_err(|log| build_failed(label, log))?;
        let kernel_names = compiler::entry_points(&checked.module, naga::ShaderStage::Compute);
        if kernel_names.is_empty() {
            return Err(build_failed(label, "program declares no @compute entry point".into()));
        }
        let module = create_module(gpu, label, &checked)?;

        debug!(
            "built program '{label}' ({} bytes, workgroup {}): kernels {:?}",
            checked.source.len(),
            options.workgroup,
            kernel_names
        );
        Ok(KernelProgram { module, kernel_names, options: *options, label: label.to_string() })
    }

    /// Build the source registered under `name`.
    pub fn from_registry(
        gpu: &GpuDevice,
        registry: &KernelRegistry,
        name: &str,
        options: &BuildOptions,
    ) -> Result<Self, BuildError> {
        let fragments =
            registry.get(name).ok_or_else(|| BuildError::UnknownSource(name.to_string()))?;
        Self::build(gpu, name, &fragments, options)
    }

    /// Kernel entry points in source order.
    pub fn kernel_names(&self) -> &[String] {
        &self.kernel_names
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Resolve the kernel `name` into a dispatchable compute pipeline.
    pub fn resolve_kernel(&self, gpu: &GpuDevice, name: &str) -> Result<Kernel, BuildError> {
        if !self.kernel_names.iter().any(|k| k == name) {
            return Err(BuildError::SymbolNotFound {
                name: name.to_string(),
                available: self.kernel_names.clone(),
            });
        }

        let (pipeline, err) = gpu.capture_errors(|| {
            gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: None,
                module: &self.module,
                entry_point: name,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        });
        if let Some(e) = err {
            return Err(build_failed(name, e.to_string()));
        }

        let bind_group_layout = pipeline.get_bind_group_layout(0);
        Ok(Kernel {
            name: name.to_string(),
            pipeline,
            bind_group_layout,
            workgroup: self.options.workgroup,
        })
    }
}

/// One resolved kernel entry point.
pub struct Kernel {
    pub(crate) name: String,
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) bind_group_layout: wgpu::BindGroupLayout,
    pub(crate) workgroup: WorkgroupSize,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tile this kernel was built for.
    pub fn workgroup(&self) -> WorkgroupSize {
        self.workgroup
    }
}

fn create_module(
    gpu: &GpuDevice,
    label: &str,
    checked: &CheckedModule,
) -> Result<wgpu::ShaderModule, BuildError> {
    compiler::create_module(gpu, label, checked).map_err(|log| build_failed(label, log))
}

fn build_failed(label: &str, log: String) -> BuildError {
    error!("build of '{label}' failed:\n{log}");
    BuildError::BuildFailed { log }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_linear() {
        assert_eq!(BuildOptions::default().workgroup, WorkgroupSize::linear());
    }

    #[test]
    fn test_build_error_display_includes_log() {
        let e = BuildError::BuildFailed { log: "error: expected ';'".into() };
        assert!(e.to_string().contains("expected ';'"));
        let e = BuildError::SymbolNotFound { name: "nope".into(), available: vec!["saxpy".into()] };
        assert!(e.to_string().contains("nope"));
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_build_and_resolve_builtin() {
        let gpu = GpuDevice::with_kind(crate::gpu::device::DeviceKind::Any).unwrap();
        let reg = KernelRegistry::builtin();
        let prog = KernelProgram::from_registry(&gpu, &reg, KernelRegistry::SAXPY, &BuildOptions::default())
            .expect("saxpy builds");
        assert_eq!(prog.kernel_names(), &["saxpy".to_string()]);
        assert_eq!(prog.label(), KernelRegistry::SAXPY);
        assert_eq!(prog.options().workgroup, WorkgroupSize::linear());
        assert!(prog.resolve_kernel(&gpu, "saxpy").is_ok());
        assert!(matches!(
            prog.resolve_kernel(&gpu, "vecAdd"),
            Err(BuildError::SymbolNotFound { .. })
        ));
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_bad_source_fails_with_log() {
        let gpu = GpuDevice::with_kind(crate::gpu::device::DeviceKind::Any).unwrap();
        let mut reg = KernelRegistry::builtin();
        reg.insert(KernelRegistry::SAXPY, ["@compute @workgroup_size(64) fn saxpy( {"]);
        let err = KernelProgram::from_registry(&gpu, &reg, KernelRegistry::SAXPY, &BuildOptions::default())
            .err()
            .expect("broken source must not build");
        match err {
            BuildError::BuildFailed { log } => assert!(!log.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
