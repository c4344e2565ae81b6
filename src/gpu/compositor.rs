// gpu/compositor.rs — Four-unit shader compositor with synchronous read-back.
//
// PIPELINE (one `render_frame`)
// ─────────────────────────────
//   frame (gray / rgb / rgba)
//     └─ expand to RGBA8 in the reusable staging buffer
//          └─ write_texture into units 0..3          (same frame, all four)
//               └─ clear to black, draw 24 vertices  (2×2 quadrants)
//                    └─ copy_texture_to_buffer → map → compact rows
//
// Broadcasting one frame into all four units is a placeholder: the layout
// has four independent sampler slots, but only one input stream exists.
// Independent per-unit inputs are not implemented.
//
// RENDER TARGET
// ─────────────
// Rendering is headless into an `Rgba8Unorm` texture of size
// max(viewport, frame). The viewport is anchored bottom-left as on a GL
// surface, and the read-back region is the frame's size anchored at the
// same corner. Rows come back bottom-up (first row = bottom of the image),
// so a vertical flip yields top-down order.
//
// BINDINGS (group 0, fixed)
// ─────────────────────────
//   0      uniform CompositeUniforms   { texture_size, output_size, units }
//   1..=4  texture_2d<f32>             unit 0..3
//   5..=8  sampler                     unit 0 linear, 1..3 nearest
//
// Vertex attributes are found by name: `a_position` and `a_tex_coord`.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use thiserror::Error;
use wgpu::util::DeviceExt;

use crate::frame::{expand_to_rgba8, FrameBuffer};
use crate::gpu::compiler::{self, CheckedModule};
use crate::gpu::device::GpuDevice;
use crate::gpu::memory::{align_to, map_read, scoped, DispatchError, Status};

/// Number of texture units sampled by the fragment stage.
pub const TEXTURE_UNITS: usize = 4;

/// Vertices in one draw: four quadrants of two triangles.
pub const VERTEX_COUNT: u32 = 24;

pub const POSITION_ATTRIBUTE: &str = "a_position";
pub const TEX_COORD_ATTRIBUTE: &str = "a_tex_coord";

/// Clip-space positions, quadrants in order top-left, top-right,
/// bottom-left, bottom-right.
#[rustfmt::skip]
pub const QUAD_POSITIONS: [f32; 48] = [
    -1.0,  0.0,   0.0,  0.0,  -1.0,  1.0,  -1.0,  1.0,   0.0,  0.0,   0.0,  1.0,
     0.0,  0.0,   1.0,  0.0,   0.0,  1.0,   0.0,  1.0,   1.0,  0.0,   1.0,  1.0,
    -1.0, -1.0,   0.0, -1.0,  -1.0,  0.0,  -1.0,  0.0,   0.0, -1.0,   0.0,  0.0,
     0.0, -1.0,   1.0, -1.0,   0.0,  0.0,   0.0,  0.0,   1.0, -1.0,   1.0,  0.0,
];

/// Texture coordinates, the same six per quadrant.
#[rustfmt::skip]
pub const QUAD_TEX_COORDS: [f32; 48] = [
    0.0, 1.0,  1.0, 1.0,  0.0, 0.0,  0.0, 0.0,  1.0, 1.0,  1.0, 0.0,
    0.0, 1.0,  1.0, 1.0,  0.0, 0.0,  0.0, 0.0,  1.0, 1.0,  1.0, 0.0,
    0.0, 1.0,  1.0, 1.0,  0.0, 0.0,  0.0, 0.0,  1.0, 1.0,  1.0, 0.0,
    0.0, 1.0,  1.0, 1.0,  0.0, 0.0,  0.0, 0.0,  1.0, 1.0,  1.0, 0.0,
];

/// Pass-through vertex stage. Forwards the quadrant index (vertex / 6) so
/// the fragment stage can pick a unit per quadrant.
pub const DEFAULT_VERTEX_SHADER: &str = r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coord: vec2<f32>,
    @location(1) @interpolate(flat) quadrant: u32,
};

@vertex
fn vs_main(
    @builtin(vertex_index) index: u32,
    @location(0) a_position: vec2<f32>,
    @location(1) a_tex_coord: vec2<f32>,
) -> VsOut {
    var out: VsOut;
    out.position = vec4<f32>(a_position, 0.0, 1.0);
    out.tex_coord = a_tex_coord;
    out.quadrant = index / 6u;
    return out;
}
"#;

/// Samples the unit assigned to the fragment's quadrant.
pub const DEFAULT_FRAGMENT_SHADER: &str = r#"
struct CompositeUniforms {
    texture_size: vec2<f32>,
    output_size: vec2<f32>,
    units: vec4<u32>,
};

@group(0) @binding(0) var<uniform> uniforms: CompositeUniforms;
@group(0) @binding(1) var texture0: texture_2d<f32>;
@group(0) @binding(2) var texture1: texture_2d<f32>;
@group(0) @binding(3) var texture2: texture_2d<f32>;
@group(0) @binding(4) var texture3: texture_2d<f32>;
@group(0) @binding(5) var sampler0: sampler;
@group(0) @binding(6) var sampler1: sampler;
@group(0) @binding(7) var sampler2: sampler;
@group(0) @binding(8) var sampler3: sampler;

@fragment
fn fs_main(
    @location(0) tex_coord: vec2<f32>,
    @location(1) @interpolate(flat) quadrant: u32,
) -> @location(0) vec4<f32> {
    let c0 = textureSample(texture0, sampler0, tex_coord);
    let c1 = textureSample(texture1, sampler1, tex_coord);
    let c2 = textureSample(texture2, sampler2, tex_coord);
    let c3 = textureSample(texture3, sampler3, tex_coord);

    var color = c0;
    switch uniforms.units[min(quadrant, 3u)] {
        case 1u: { color = c1; }
        case 2u: { color = c2; }
        case 3u: { color = c3; }
        default: { color = c0; }
    }
    return color;
}
"#;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Shader compile and link failures. Each carries the full log.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("vertex shader failed to compile:\n{0}")]
    VertexCompileFailed(String),
    #[error("fragment shader failed to compile:\n{0}")]
    FragmentCompileFailed(String),
    #[error("shader program failed to link:\n{0}")]
    LinkFailed(String),
}

#[derive(Debug, Error)]
pub enum CompositorError {
    /// An operation was called in the wrong lifecycle state.
    #[error("compositor is {state}, expected {expected}")]
    NotReady { state: CompositorState, expected: CompositorState },
    /// The frame buffer does not match the declared dimensions.
    #[error("frame is {actual}, render_frame was asked for {width}×{height}")]
    FrameMismatch { width: u32, height: u32, actual: String },
    #[error("invalid viewport {width}×{height}")]
    InvalidViewport { width: u32, height: u32 },
    /// A frame or viewport dimension is above the device's 2D texture limit.
    #[error("{what} {width}×{height} exceeds the device texture limit of {max}")]
    TooLarge { what: &'static str, width: u32, height: u32, max: u32 },
    /// Texture or render-target allocation was rejected by the device.
    #[error("texture upload failed: {0}")]
    Upload(DispatchError),
    /// The device rejected the draw submission.
    #[error("draw failed: {0}")]
    Draw(String),
    #[error(transparent)]
    Readback(#[from] DispatchError),
}

// ---------------------------------------------------------------------------
// ShaderProgram
// ---------------------------------------------------------------------------

/// A linked vertex + fragment pipeline over the fixed binding layout.
pub struct ShaderProgram {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    attributes: HashMap<String, u32>,
    bindings: HashMap<String, (u32, u32)>,
    _vertex: wgpu::ShaderModule,
    _fragment: wgpu::ShaderModule,
}

impl ShaderProgram {
    /// Compile both stages and link them into a render pipeline.
    pub fn compile(
        gpu: &GpuDevice,
        vertex_src: &str,
        fragment_src: &str,
    ) -> Result<Self, CompileError> {
        let (vs_checked, vs_entry, vertex) =
            compile_stage(gpu, vertex_src, naga::ShaderStage::Vertex)
                .map_err(CompileError::VertexCompileFailed)?;
        let (fs_checked, fs_entry, fragment) =
            compile_stage(gpu, fragment_src, naga::ShaderStage::Fragment)
                .map_err(CompileError::FragmentCompileFailed)?;

        // Link: resolve attribute locations, then create the pipeline.
        let attributes = compiler::vertex_attributes(&vs_checked.module, &vs_entry);
        let position = attribute(&attributes, POSITION_ATTRIBUTE)?;
        let tex_coord = attribute(&attributes, TEX_COORD_ATTRIBUTE)?;

        let mut bindings = compiler::resource_bindings(&vs_checked.module);
        bindings.extend(compiler::resource_bindings(&fs_checked.module));

        let bind_group_layout = composite_bind_group_layout(gpu);
        let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ShaderProgram layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let position_attr = [wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: 0,
            shader_location: position,
        }];
        let tex_coord_attr = [wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: 0,
            shader_location: tex_coord,
        }];
        let buffers = [
            wgpu::VertexBufferLayout {
                array_stride: 8,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &position_attr,
            },
            wgpu::VertexBufferLayout {
                array_stride: 8,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &tex_coord_attr,
            },
        ];

        let (pipeline, err) = gpu.capture_errors(|| {
            gpu.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("ShaderProgram"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &vertex,
                    entry_point: &vs_entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &buffers,
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &fragment,
                    entry_point: &fs_entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            })
        });
        if let Some(e) = err {
            error!("shader program link failed: {e}");
            return Err(CompileError::LinkFailed(e.to_string()));
        }

        info!(
            "linked shader program ({vs_entry} + {fs_entry}): {POSITION_ATTRIBUTE}@{position}, \
             {TEX_COORD_ATTRIBUTE}@{tex_coord}"
        );
        Ok(ShaderProgram {
            pipeline,
            bind_group_layout,
            attributes,
            bindings,
            _vertex: vertex,
            _fragment: fragment,
        })
    }

    /// The built-in pass-through program.
    pub fn default_program(gpu: &GpuDevice) -> Result<Self, CompileError> {
        Self::compile(gpu, DEFAULT_VERTEX_SHADER, DEFAULT_FRAGMENT_SHADER)
    }

    /// `@location` of a vertex attribute.
    pub fn attribute_location(&self, name: &str) -> Option<u32> {
        self.attributes.get(name).copied()
    }

    /// `(group, binding)` of a uniform, texture or sampler.
    pub fn binding(&self, name: &str) -> Option<(u32, u32)> {
        self.bindings.get(name).copied()
    }
}

fn compile_stage(
    gpu: &GpuDevice,
    source: &str,
    stage: naga::ShaderStage,
) -> Result<(CheckedModule, String, wgpu::ShaderModule), String> {
    let checked = compiler::check_wgsl(source)?;
    let entry = compiler::entry_points(&checked.module, stage)
        .into_iter()
        .next()
        .ok_or_else(|| format!("no {stage:?} entry point in shader source"))?;
    let module = compiler::create_module(gpu, &format!("{stage:?} shader"), &checked)?;
    Ok((checked, entry, module))
}

fn attribute(attributes: &HashMap<String, u32>, name: &str) -> Result<u32, CompileError> {
    attributes.get(name).copied().ok_or_else(|| {
        let mut found: Vec<&str> = attributes.keys().map(String::as_str).collect();
        found.sort_unstable();
        CompileError::LinkFailed(format!(
            "vertex attribute '{name}' not found (vertex inputs: {found:?})"
        ))
    })
}

fn composite_bind_group_layout(gpu: &GpuDevice) -> wgpu::BindGroupLayout {
    let mut entries = Vec::with_capacity(1 + 2 * TEXTURE_UNITS);
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    });
    for unit in 0..TEXTURE_UNITS as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 1 + unit,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        });
    }
    for unit in 0..TEXTURE_UNITS as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 1 + TEXTURE_UNITS as u32 + unit,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("CompositeBGL"),
        entries: &entries,
    })
}

// ---------------------------------------------------------------------------
// TextureUnit
// ---------------------------------------------------------------------------

/// Sampling filter of a texture unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Linear,
    Nearest,
}

impl From<Filter> for wgpu::FilterMode {
    fn from(f: Filter) -> Self {
        match f {
            Filter::Linear => wgpu::FilterMode::Linear,
            Filter::Nearest => wgpu::FilterMode::Nearest,
        }
    }
}

/// One sampler slot. The texture is allocated on first upload and reused
/// while the frame size stays the same.
pub struct TextureUnit {
    pub index: u32,
    pub filter: Filter,
    sampler: wgpu::Sampler,
    texture: Option<(wgpu::Texture, wgpu::TextureView)>,
    size: (u32, u32),
}

impl TextureUnit {
    fn new(gpu: &GpuDevice, index: u32, filter: Filter) -> Self {
        let sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("TextureUnit sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter.into(),
            min_filter: filter.into(),
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        TextureUnit { index, filter, sampler, texture: None, size: (0, 0) }
    }

    /// Whether a texture has been allocated.
    pub fn is_allocated(&self) -> bool {
        self.texture.is_some()
    }

    fn release(&mut self) {
        self.texture = None;
        self.size = (0, 0);
    }

    /// Upload tightly packed RGBA8 pixels.
    fn upload(&mut self, gpu: &GpuDevice, rgba: &[u8], width: u32, height: u32) {
        if self.texture.is_none() || self.size != (width, height) {
            let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("TextureUnit"),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            debug!("texture unit {} allocated at {width}×{height}", self.index);
            self.texture = Some((texture, view));
            self.size = (width, height);
        }
        if let Some((texture, _)) = &self.texture {
            gpu.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                rgba,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(width * 4),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Uniforms
// ---------------------------------------------------------------------------

/// Uniform block shared by both stages. Matches the WGSL
/// `CompositeUniforms` layout (32 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CompositeUniforms {
    pub texture_size: [f32; 2],
    pub output_size: [f32; 2],
    /// Texture unit sampled by each quadrant.
    pub units: [u32; 4],
}

impl CompositeUniforms {
    pub fn new(frame: (u32, u32), viewport: Viewport) -> Self {
        CompositeUniforms {
            texture_size: [frame.0 as f32, frame.1 as f32],
            output_size: [viewport.width as f32, viewport.height as f32],
            units: [0, 1, 2, 3],
        }
    }
}

// ---------------------------------------------------------------------------
// ShaderCompositor
// ---------------------------------------------------------------------------

/// Output draw region, anchored at the bottom-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorState {
    Uninitialized,
    Initialized,
    Ready,
    Rendering,
}

impl fmt::Display for CompositorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompositorState::Uninitialized => "uninitialized",
            CompositorState::Initialized => "initialized",
            CompositorState::Ready => "ready",
            CompositorState::Rendering => "rendering",
        };
        f.write_str(s)
    }
}

/// Result of one `render_frame`.
pub struct Readback {
    /// RGBA8 pixels, rows bottom-up.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub upload_time: Duration,
    pub draw_time: Duration,
    pub readback_time: Duration,
}

struct GpuResources {
    units: Vec<TextureUnit>,
    positions: wgpu::Buffer,
    tex_coords: wgpu::Buffer,
    uniforms: wgpu::Buffer,
}

struct RenderTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

pub struct ShaderCompositor {
    state: CompositorState,
    resources: Option<GpuResources>,
    program: Option<ShaderProgram>,
    target: Option<RenderTarget>,
    viewport: Viewport,
    max_dimension: u32,
    staging: Vec<u8>,
}

impl Default for ShaderCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderCompositor {
    pub fn new() -> Self {
        ShaderCompositor {
            state: CompositorState::Uninitialized,
            resources: None,
            program: None,
            target: None,
            viewport: Viewport { width: 1, height: 1 },
            max_dimension: u32::MAX,
            staging: Vec::new(),
        }
    }

    pub fn state(&self) -> CompositorState {
        self.state
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn texture_units(&self) -> &[TextureUnit] {
        self.resources.as_ref().map(|r| r.units.as_slice()).unwrap_or(&[])
    }

    /// Create the four texture units and the vertex and uniform buffers.
    /// Unit 0 filters linearly, units 1..3 use nearest.
    pub fn init_textures(&mut self, gpu: &GpuDevice) {
        let units = (0..TEXTURE_UNITS as u32)
            .map(|i| TextureUnit::new(gpu, i, if i == 0 { Filter::Linear } else { Filter::Nearest }))
            .collect();
        let positions = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad positions"),
            contents: bytemuck::cast_slice(&QUAD_POSITIONS),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let tex_coords = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad tex coords"),
            contents: bytemuck::cast_slice(&QUAD_TEX_COORDS),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let uniforms = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("CompositeUniforms"),
            size: std::mem::size_of::<CompositeUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.resources = Some(GpuResources { units, positions, tex_coords, uniforms });
        self.max_dimension = gpu.limits.max_texture_dimension_2d;
        if self.state == CompositorState::Uninitialized {
            self.state = CompositorState::Initialized;
        }
        debug!("compositor: {TEXTURE_UNITS} texture units initialised");
    }

    /// Install a linked program. Replaces (and drops) any previous one.
    pub fn load_program(&mut self, program: ShaderProgram) -> Result<(), CompositorError> {
        if self.state == CompositorState::Uninitialized {
            return Err(CompositorError::NotReady {
                state: self.state,
                expected: CompositorState::Initialized,
            });
        }
        self.program = Some(program);
        self.state = CompositorState::Ready;
        Ok(())
    }

    /// Set the output viewport. Once the texture units exist the size is
    /// also checked against the device's 2D texture limit.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), CompositorError> {
        if width == 0 || height == 0 {
            return Err(CompositorError::InvalidViewport { width, height });
        }
        check_dimensions("viewport", width, height, self.max_dimension)?;
        self.viewport = Viewport { width, height };
        debug!("compositor viewport {width}×{height}");
        Ok(())
    }

    /// Upload `frame` into all four units, draw, and read back
    /// `width × height` pixels.
    pub fn render_frame(
        &mut self,
        gpu: &GpuDevice,
        frame: &FrameBuffer,
        width: u32,
        height: u32,
    ) -> Result<Readback, CompositorError> {
        if self.state != CompositorState::Ready {
            return Err(CompositorError::NotReady {
                state: self.state,
                expected: CompositorState::Ready,
            });
        }
        if frame.width() != width || frame.height() != height {
            return Err(CompositorError::FrameMismatch {
                width,
                height,
                actual: frame.format().to_string(),
            });
        }
        let max = gpu.limits.max_texture_dimension_2d;
        check_dimensions("frame", width, height, max)?;
        check_dimensions("viewport", self.viewport.width, self.viewport.height, max)?;

        self.state = CompositorState::Rendering;
        let result = self.render_inner(gpu, frame, width, height);
        self.state = CompositorState::Ready;
        result
    }

    fn render_inner(
        &mut self,
        gpu: &GpuDevice,
        frame: &FrameBuffer,
        width: u32,
        height: u32,
    ) -> Result<Readback, CompositorError> {
        let not_ready = CompositorError::NotReady {
            state: CompositorState::Uninitialized,
            expected: CompositorState::Ready,
        };

        // --- Upload ---
        let t_upload = Instant::now();
        let rgba_len = width as usize * height as usize * 4;
        self.staging.resize(rgba_len, 0);
        expand_to_rgba8(
            frame.as_slice(),
            frame.format().layout,
            frame.format().pixel_count(),
            &mut self.staging,
        );
        let (Some(res), Some(program)) = (self.resources.as_mut(), self.program.as_ref()) else {
            return Err(not_ready);
        };
        // TODO: per-unit input streams; every unit receives the same frame.
        let staging = &self.staging;
        let uploaded = scoped(gpu, "upload_texture", Status::InvalidOperation, || {
            for unit in res.units.iter_mut() {
                unit.upload(gpu, staging, width, height);
            }
        });
        if let Err(e) = uploaded {
            res.units.iter_mut().for_each(TextureUnit::release);
            return Err(CompositorError::Upload(e));
        }
        gpu.queue.write_buffer(
            &res.uniforms,
            0,
            bytemuck::bytes_of(&CompositeUniforms::new((width, height), self.viewport)),
        );
        let upload_time = t_upload.elapsed();

        // --- Draw ---
        let t_draw = Instant::now();
        let target_w = self.viewport.width.max(width);
        let target_h = self.viewport.height.max(height);
        let slot = &mut self.target;
        if let Err(e) = scoped(gpu, "create_render_target", Status::OutOfResources, || {
            ensure_target(slot, gpu, target_w, target_h)
        }) {
            self.target = None;
            return Err(CompositorError::Upload(e));
        }
        let Some(target) = self.target.as_ref() else {
            return Err(not_ready);
        };

        let mut entries = Vec::with_capacity(1 + 2 * TEXTURE_UNITS);
        entries.push(wgpu::BindGroupEntry { binding: 0, resource: res.uniforms.as_entire_binding() });
        for unit in &res.units {
            let Some((_, view)) = &unit.texture else {
                return Err(not_ready);
            };
            entries.push(wgpu::BindGroupEntry {
                binding: 1 + unit.index,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        for unit in &res.units {
            entries.push(wgpu::BindGroupEntry {
                binding: 1 + TEXTURE_UNITS as u32 + unit.index,
                resource: wgpu::BindingResource::Sampler(&unit.sampler),
            });
        }

        let (_, err) = gpu.capture_errors(|| {
            let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("composite"),
                layout: &program.bind_group_layout,
                entries: &entries,
            });
            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("composite") });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("composite"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                // Bottom-left anchored viewport.
                let vp = self.viewport;
                pass.set_viewport(
                    0.0,
                    (target.height - vp.height) as f32,
                    vp.width as f32,
                    vp.height as f32,
                    0.0,
                    1.0,
                );
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, res.positions.slice(..));
                pass.set_vertex_buffer(1, res.tex_coords.slice(..));
                pass.draw(0..VERTEX_COUNT, 0..1);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = err {
            error!("composite draw failed: {e}");
            return Err(CompositorError::Draw(e.to_string()));
        }
        let draw_time = t_draw.elapsed();

        // --- Read back ---
        let t_read = Instant::now();
        let pixels = read_pixels(gpu, target, width, height)?;
        let readback_time = t_read.elapsed();

        debug!(
            "frame {width}×{height}: upload {:.3} ms, draw {:.3} ms, read-back {:.3} ms",
            upload_time.as_secs_f64() * 1e3,
            draw_time.as_secs_f64() * 1e3,
            readback_time.as_secs_f64() * 1e3
        );
        Ok(Readback { pixels, width, height, upload_time, draw_time, readback_time })
    }
}

fn check_dimensions(what: &'static str, width: u32, height: u32, max: u32) -> Result<(), CompositorError> {
    if width > max || height > max {
        return Err(CompositorError::TooLarge { what, width, height, max });
    }
    Ok(())
}

fn ensure_target(slot: &mut Option<RenderTarget>, gpu: &GpuDevice, width: u32, height: u32) {
    let target = match slot.take() {
        Some(t) if t.width == width && t.height == height => t,
        _ => {
            let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("composite target"),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TARGET_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            debug!("render target {width}×{height}");
            RenderTarget { texture, view, width, height }
        }
    };
    *slot = Some(target);
}

/// Synchronous read of the bottom-left `width × height` region, rows
/// bottom-up.
fn read_pixels(
    gpu: &GpuDevice,
    target: &RenderTarget,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, DispatchError> {
    let row = width as usize * 4;
    let padded = align_to(width * 4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    let staging = scoped(gpu, "read_pixels", Status::OutOfResources, || {
        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("composite read-back"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read_pixels") });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: target.height - height, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));
        staging
    })?;

    let mut pixels = vec![0u8; row * height as usize];
    map_read(gpu, "read_pixels", &staging, |mapped| {
        // Texture rows are top-down; emit them bottom-up.
        for (dst, src) in pixels.chunks_exact_mut(row).zip(mapped.chunks(padded as usize).rev()) {
            dst.copy_from_slice(&src[..row]);
        }
    })?;
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFormat, PixelLayout};

    #[test]
    fn test_quad_layout() {
        assert_eq!(QUAD_POSITIONS.len(), VERTEX_COUNT as usize * 2);
        assert_eq!(QUAD_TEX_COORDS.len(), VERTEX_COUNT as usize * 2);
        // Each quadrant spans exactly one unit square of clip space.
        for quad in QUAD_POSITIONS.chunks(12) {
            let xs: Vec<f32> = quad.iter().step_by(2).copied().collect();
            let ys: Vec<f32> = quad.iter().skip(1).step_by(2).copied().collect();
            let span = |v: &[f32]| {
                v.iter().cloned().fold(f32::MIN, f32::max) - v.iter().cloned().fold(f32::MAX, f32::min)
            };
            assert_eq!(span(&xs), 1.0);
            assert_eq!(span(&ys), 1.0);
        }
    }

    #[test]
    fn test_dimension_limit() {
        assert!(check_dimensions("frame", 16384, 1, 16384).is_ok());
        let err = check_dimensions("frame", 16385, 1, 16384).unwrap_err();
        assert!(matches!(err, CompositorError::TooLarge { width: 16385, height: 1, max: 16384, .. }));
        assert!(err.to_string().contains("16385×1"));
    }

    #[test]
    fn test_resize_before_init_only_rejects_zero() {
        let mut c = ShaderCompositor::new();
        assert!(matches!(c.resize(0, 4), Err(CompositorError::InvalidViewport { .. })));
        c.resize(20000, 4).unwrap();
        assert_eq!(c.viewport(), Viewport { width: 20000, height: 4 });
    }

    #[test]
    fn test_uniform_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<CompositeUniforms>(), 32);
        let u = CompositeUniforms::new((1920, 1080), Viewport { width: 800, height: 600 });
        assert_eq!(u.texture_size, [1920.0, 1080.0]);
        assert_eq!(u.output_size, [800.0, 600.0]);
        assert_eq!(u.units, [0, 1, 2, 3]);
    }

    #[test]
    fn test_default_shaders_validate() {
        let vs = compiler::check_wgsl(DEFAULT_VERTEX_SHADER).expect("vertex");
        let attrs = compiler::vertex_attributes(&vs.module, "vs_main");
        assert!(attrs.contains_key(POSITION_ATTRIBUTE));
        assert!(attrs.contains_key(TEX_COORD_ATTRIBUTE));

        let fs = compiler::check_wgsl(DEFAULT_FRAGMENT_SHADER).expect("fragment");
        let b = compiler::resource_bindings(&fs.module);
        assert_eq!(b.get("uniforms"), Some(&(0, 0)));
        assert_eq!(b.get("texture3"), Some(&(0, 4)));
        assert_eq!(b.get("sampler0"), Some(&(0, 5)));
    }

    #[test]
    fn test_render_before_ready_is_rejected() {
        let mut c = ShaderCompositor::new();
        assert_eq!(c.state(), CompositorState::Uninitialized);
        assert!(c.texture_units().is_empty());
        assert!(c.resize(0, 10).is_err());
        assert!(c.resize(640, 480).is_ok());
        assert_eq!(c.viewport(), Viewport { width: 640, height: 480 });
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_missing_attribute_fails_link() {
        let gpu = GpuDevice::with_kind(crate::gpu::device::DeviceKind::Any).unwrap();
        let vs = "@vertex fn main(@location(0) pos: vec2<f32>) -> @builtin(position) vec4<f32> { \
                  return vec4<f32>(pos, 0.0, 1.0); }";
        match ShaderProgram::compile(&gpu, vs, DEFAULT_FRAGMENT_SHADER) {
            Err(CompileError::LinkFailed(log)) => assert!(log.contains(POSITION_ATTRIBUTE)),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("link must fail"),
        }
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gray_frame_renders_gray() {
        let gpu = GpuDevice::with_kind(crate::gpu::device::DeviceKind::Any).unwrap();
        let mut c = ShaderCompositor::new();
        c.init_textures(&gpu);
        assert!(c.texture_units().iter().all(|u| !u.is_allocated()));
        c.load_program(ShaderProgram::default_program(&gpu).unwrap()).unwrap();
        c.resize(64, 32).unwrap();

        let frame = FrameBuffer::from_vec(FrameFormat::new(64, 32, PixelLayout::Gray8), vec![77u8; 64 * 32]);
        let rb = c.render_frame(&gpu, &frame, 64, 32).unwrap();
        assert_eq!(rb.pixels.len(), 64 * 32 * 4);
        assert!(rb.pixels.chunks(4).all(|p| p == [77, 77, 77, 255]));
        assert!(c.texture_units().iter().all(|u| u.is_allocated()));
        assert_eq!(c.state(), CompositorState::Ready);
    }
}
