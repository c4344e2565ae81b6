// gpu/compiler.rs — WGSL front-end checks and reflection.
//
// wgpu reports shader errors through its error callback, which only carries
// a summary. For build diagnostics we run the naga front-end ourselves
// first: parse + validate the concatenated source and, on failure, render
// naga's annotated report (source excerpt, caret, notes) as the build log.
//
// The same parsed `naga::Module` is then used for reflection:
//   - entry point names per stage (kernel resolution, vertex/fragment entry)
//   - vertex attribute locations by argument/member name
//   - resource bindings by global variable name
//
// The device still compiles the module on its own; `create_module` wraps
// that in an error scope so driver-side rejections surface as a log too.

use std::collections::HashMap;

use crate::gpu::device::GpuDevice;

/// Result of a successful front-end check.
pub struct CheckedModule {
    /// The exact source text that was checked (after concatenation and
    /// placeholder substitution).
    pub source: String,
    pub module: naga::Module,
}

/// Parse and validate WGSL. On failure the `Err` holds the full
/// diagnostic report, never an empty string.
pub fn check_wgsl(source: &str) -> Result<CheckedModule, String> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| non_empty(e.emit_to_string(source), "WGSL parse error"))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(&module)
        .map_err(|e| non_empty(e.emit_to_string(source), "WGSL validation error"))?;

    Ok(CheckedModule { source: source.to_string(), module })
}

/// Create a shader module on the device, capturing validation errors.
pub fn create_module(
    gpu: &GpuDevice,
    label: &str,
    checked: &CheckedModule,
) -> Result<wgpu::ShaderModule, String> {
    let (module, err) = gpu.capture_errors(|| {
        gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(checked.source.as_str().into()),
        })
    });
    match err {
        None => Ok(module),
        Some(e) => Err(non_empty(e.to_string(), "shader module creation failed")),
    }
}

fn non_empty(log: String, fallback: &str) -> String {
    if log.trim().is_empty() {
        fallback.to_string()
    } else {
        log
    }
}

// ---------------------------------------------------------------------------
// Reflection
// ---------------------------------------------------------------------------

/// Names of all entry points of `stage`, in source order.
pub fn entry_points(module: &naga::Module, stage: naga::ShaderStage) -> Vec<String> {
    module
        .entry_points
        .iter()
        .filter(|ep| ep.stage == stage)
        .map(|ep| ep.name.clone())
        .collect()
}

/// Map from vertex input name to `@location` for the named entry point.
///
/// Inputs may be declared either as plain arguments or as members of a
/// struct argument; both are collected.
pub fn vertex_attributes(module: &naga::Module, entry: &str) -> HashMap<String, u32> {
    let mut out = HashMap::new();
    let Some(ep) = module.entry_points.iter().find(|ep| ep.name == entry) else {
        return out;
    };
    for arg in &ep.function.arguments {
        match (&arg.binding, &arg.name) {
            (Some(naga::Binding::Location { location, .. }), Some(name)) => {
                out.insert(name.clone(), *location);
            }
            (None, _) => {
                if let naga::TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
                    for m in members {
                        if let (Some(naga::Binding::Location { location, .. }), Some(name)) =
                            (&m.binding, &m.name)
                        {
                            out.insert(name.clone(), *location);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Map from global resource name to `(group, binding)`.
pub fn resource_bindings(module: &naga::Module) -> HashMap<String, (u32, u32)> {
    module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let name = var.name.clone()?;
            let rb = var.binding.as_ref()?;
            Some((name, (rb.group, rb.binding)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VS: &str = "
struct VsIn {
    @location(0) a_position: vec2<f32>,
    @location(1) a_tex_coord: vec2<f32>,
};
@vertex
fn vs_main(v: VsIn) -> @builtin(position) vec4<f32> {
    return vec4<f32>(v.a_position + v.a_tex_coord * 0.0, 0.0, 1.0);
}
";

    #[test]
    fn test_syntax_error_has_log() {
        let err = check_wgsl("@fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0 }")
            .err()
            .expect("syntax error must fail");
        assert!(!err.trim().is_empty());
    }

    #[test]
    fn test_validation_error_has_log() {
        // Parses, but returns the wrong type.
        let err = check_wgsl("fn f() -> u32 { return 1.0; }").err().expect("type error must fail");
        assert!(!err.trim().is_empty());
    }

    #[test]
    fn test_struct_attributes_reflected() {
        let checked = check_wgsl(VS).expect("valid vertex shader");
        let attrs = vertex_attributes(&checked.module, "vs_main");
        assert_eq!(attrs.get("a_position"), Some(&0));
        assert_eq!(attrs.get("a_tex_coord"), Some(&1));
        assert_eq!(entry_points(&checked.module, naga::ShaderStage::Vertex), vec!["vs_main"]);
    }

    #[test]
    fn test_argument_attributes_reflected() {
        let src = "
@vertex
fn main(@location(3) a_position: vec2<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(a_position, 0.0, 1.0);
}";
        let checked = check_wgsl(src).unwrap();
        assert_eq!(vertex_attributes(&checked.module, "main").get("a_position"), Some(&3));
        assert!(vertex_attributes(&checked.module, "missing").is_empty());
    }

    #[test]
    fn test_resource_bindings() {
        let src = "
@group(0) @binding(2) var tex: texture_2d<f32>;
@group(0) @binding(6) var samp: sampler;
@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return textureSample(tex, samp, vec2<f32>(0.5, 0.5));
}";
        let checked = check_wgsl(src).unwrap();
        let b = resource_bindings(&checked.module);
        assert_eq!(b.get("tex"), Some(&(0, 2)));
        assert_eq!(b.get("samp"), Some(&(0, 6)));
    }
}
