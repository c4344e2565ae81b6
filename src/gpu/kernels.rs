// gpu/kernels.rs — Kernel source registry.
//
// Kernel programs are kept as data: each entry is an ordered list of WGSL
// fragments that the program builder concatenates. `{{WG_X}}` / `{{WG_Y}}`
// are filled in from the build options (see `WorkgroupSize::substitutions`).
//
// Entries are immutable once registered. Tests swap a name's source with
// `insert` to exercise build failures without touching the built-ins.
//
// Binding order == kernel argument order: the argument at index i of a
// dispatch is bound to `@binding(i)` of group 0.

use std::borrow::Cow;
use std::collections::BTreeMap;

/// Elementwise combine: `c[i] = a[i] * b[i]` for `i < n`.
///
/// args: 0 = a (read), 1 = b (read), 2 = c (write), 3 = n (u32 scalar)
pub const VEC_MUL: &[&str] = &[
    "@group(0) @binding(0) var<storage, read> a: array<f32>;\n",
    "@group(0) @binding(1) var<storage, read> b: array<f32>;\n",
    "@group(0) @binding(2) var<storage, read_write> c: array<f32>;\n",
    "@group(0) @binding(3) var<uniform> n: u32;\n",
    "\n",
    "@compute @workgroup_size({{WG_X}}, {{WG_Y}}, 1)\n",
    "fn vec_mul(@builtin(global_invocation_id) gid: vec3<u32>) {\n",
    "    let id = gid.x;\n",
    "    if (id < n) {\n",
    "        c[id] = a[id] * b[id];\n",
    "    }\n",
    "}\n",
];

/// Scaled add: `C[i] = alpha * A[i] + B[i]`.
///
/// args: 0 = alpha (f32 scalar), 1 = A (read), 2 = B (read), 3 = C (write)
///
/// The guard uses the length of C, the true element count of the output.
pub const SAXPY: &[&str] = &[
    "@group(0) @binding(0) var<uniform> alpha: f32;\n",
    "@group(0) @binding(1) var<storage, read> A: array<f32>;\n",
    "@group(0) @binding(2) var<storage, read> B: array<f32>;\n",
    "@group(0) @binding(3) var<storage, read_write> C: array<f32>;\n",
    "\n",
    "@compute @workgroup_size({{WG_X}}, {{WG_Y}}, 1)\n",
    "fn saxpy(@builtin(global_invocation_id) gid: vec3<u32>) {\n",
    "    let index = gid.x;\n",
    "    if (index < arrayLength(&C)) {\n",
    "        C[index] = alpha * A[index] + B[index];\n",
    "    }\n",
    "}\n",
];

/// Copy a 2D integer image to another image of the same size.
///
/// Reads use integer (unnormalised) coordinates clamped to the edge with no
/// filtering. Texels are `rgba8uint`; single-channel planes are packed four
/// pixels per texel by the caller.
///
/// args: 0 = input (read-only image), 1 = output (write-only image)
pub const IMAGE2D_COPY: &[&str] = &[
    "@group(0) @binding(0) var src_image: texture_2d<u32>;\n",
    "@group(0) @binding(1) var dst_image: texture_storage_2d<rgba8uint, write>;\n",
    "\n",
    "fn read_clamped(coord: vec2<i32>) -> vec4<u32> {\n",
    "    let last = vec2<i32>(textureDimensions(src_image)) - vec2<i32>(1, 1);\n",
    "    return textureLoad(src_image, clamp(coord, vec2<i32>(0, 0), last), 0);\n",
    "}\n",
    "\n",
    "@compute @workgroup_size({{WG_X}}, {{WG_Y}}, 1)\n",
    "fn image2d_copy(@builtin(global_invocation_id) gid: vec3<u32>) {\n",
    "    let coord = vec2<i32>(gid.xy);\n",
    "    textureStore(dst_image, coord, read_clamped(coord));\n",
    "}\n",
];

/// Registry of kernel sources keyed by name.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    sources: BTreeMap<String, Vec<Cow<'static, str>>>,
}

impl KernelRegistry {
    /// Registry names of the built-in kernels. Each name is also the
    /// kernel's entry point.
    pub const VEC_MUL: &'static str = "vec_mul";
    pub const SAXPY: &'static str = "saxpy";
    pub const IMAGE2D_COPY: &'static str = "image2d_copy";

    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The three built-in kernels.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.insert_static(Self::VEC_MUL, VEC_MUL);
        reg.insert_static(Self::SAXPY, SAXPY);
        reg.insert_static(Self::IMAGE2D_COPY, IMAGE2D_COPY);
        reg
    }

    /// Register (or replace) `name` with owned source fragments.
    pub fn insert<I, S>(&mut self, name: &str, fragments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        self.sources.insert(name.to_string(), fragments.into_iter().map(Into::into).collect());
    }

    fn insert_static(&mut self, name: &str, fragments: &'static [&'static str]) {
        self.insert(name, fragments.iter().copied());
    }

    /// Source fragments registered under `name`, in order.
    pub fn get(&self, name: &str) -> Option<Vec<&str>> {
        self.sources.get(name).map(|f| f.iter().map(|s| s.as_ref()).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.sources.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::compiler::{check_wgsl, entry_points};
    use crate::gpu::device::WorkgroupSize;

    fn specialise(fragments: &[&str], ws: WorkgroupSize) -> String {
        let mut src = fragments.concat();
        for (key, value) in ws.substitutions() {
            src = src.replace(key, &value);
        }
        src
    }

    #[test]
    fn test_builtin_names() {
        let reg = KernelRegistry::builtin();
        let names: Vec<&str> = reg.names().collect();
        assert_eq!(names, vec!["image2d_copy", "saxpy", "vec_mul"]);
        assert!(reg.contains(KernelRegistry::VEC_MUL));
        assert!(!reg.contains("vecAdd"));
    }

    #[test]
    fn test_builtin_sources_validate() {
        // Every built-in must pass the naga front-end once specialised, and
        // expose an entry point named after its registry key.
        let reg = KernelRegistry::builtin();
        for name in reg.names() {
            let ws = if name == KernelRegistry::IMAGE2D_COPY {
                WorkgroupSize { x: 8, y: 8 }
            } else {
                WorkgroupSize::linear()
            };
            let src = specialise(&reg.get(name).unwrap(), ws);
            let checked = check_wgsl(&src).unwrap_or_else(|log| panic!("{name}:\n{log}"));
            let eps = entry_points(&checked.module, naga::ShaderStage::Compute);
            assert_eq!(eps, vec![name.to_string()]);
        }
    }

    #[test]
    fn test_insert_replaces() {
        let mut reg = KernelRegistry::builtin();
        reg.insert(KernelRegistry::SAXPY, vec![String::from("not wgsl")]);
        assert_eq!(reg.get(KernelRegistry::SAXPY), Some(vec!["not wgsl"]));
        assert!(reg.get("missing").is_none());
    }
}
