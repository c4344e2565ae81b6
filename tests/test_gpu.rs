// tests/test_gpu.rs — End-to-end checks on a real adapter.
//
// All tests are #[ignore]d so `cargo test` passes without a GPU. Run them
// with `cargo test --test test_gpu -- --ignored`.

use std::io::Cursor;

use quadframe::frame::{flip_rows_in_place, FrameBuffer, FrameFormat, PixelLayout};
use quadframe::gpu::compositor::{
    CompileError, CompositorError, CompositorState, ShaderCompositor, ShaderProgram, DEFAULT_FRAGMENT_SHADER,
    DEFAULT_VERTEX_SHADER,
};
use quadframe::gpu::compute::{run_image_copy, run_saxpy, run_vec_mul};
use quadframe::gpu::device::{DeviceKind, GpuDevice};
use quadframe::gpu::kernels::KernelRegistry;
use quadframe::gpu::memory::{
    dispatch, AccessMode, DeviceBuffer, DeviceImage, GlobalSize, ImageFormat, KernelArg, Status,
};
use quadframe::gpu::program::{BuildError, BuildOptions, KernelProgram};
use quadframe::source::FrameSource;
use quadframe::{PipelineConfig, RenderSession};

fn gpu() -> GpuDevice {
    GpuDevice::with_kind(DeviceKind::Any).expect("need a wgpu adapter")
}

// ===== Compute-kernel path =====

#[test]
#[ignore = "requires a GPU adapter"]
fn context_accepts_allocation_and_dispatch() {
    let gpu = gpu();
    let reg = KernelRegistry::builtin();
    let program =
        KernelProgram::from_registry(&gpu, &reg, KernelRegistry::SAXPY, &BuildOptions::default()).unwrap();
    let kernel = program.resolve_kernel(&gpu, "saxpy").unwrap();

    let a = DeviceBuffer::from_slice(&gpu, AccessMode::ReadOnly, &[1.0f32; 16]).unwrap();
    let b = DeviceBuffer::from_slice(&gpu, AccessMode::ReadOnly, &[2.0f32; 16]).unwrap();
    let c = DeviceBuffer::allocate(&gpu, AccessMode::WriteOnly, 64).unwrap();
    let event = dispatch(
        &gpu,
        &kernel,
        &[KernelArg::F32(3.0), KernelArg::Buffer(&a), KernelArg::Buffer(&b), KernelArg::Buffer(&c)],
        GlobalSize::Linear(16),
    )
    .unwrap();
    event.wait(&gpu).unwrap();
    assert_eq!(c.download_vec::<f32>(&gpu).unwrap(), vec![5.0; 16]);
    assert_eq!(a.mode(), AccessMode::ReadOnly);
    assert_eq!(c.mode(), AccessMode::WriteOnly);

    // Buffers are reusable across dispatches.
    a.upload_slice(&gpu, &[2.0f32; 16]).unwrap();
    let event = dispatch(
        &gpu,
        &kernel,
        &[KernelArg::F32(3.0), KernelArg::Buffer(&a), KernelArg::Buffer(&b), KernelArg::Buffer(&c)],
        GlobalSize::Linear(16),
    )
    .unwrap();
    event.wait(&gpu).unwrap();
    assert_eq!(c.download_vec::<f32>(&gpu).unwrap(), vec![8.0; 16]);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn missing_kernel_argument_is_reported() {
    let gpu = gpu();
    let reg = KernelRegistry::builtin();
    let program =
        KernelProgram::from_registry(&gpu, &reg, KernelRegistry::SAXPY, &BuildOptions::default()).unwrap();
    let kernel = program.resolve_kernel(&gpu, "saxpy").unwrap();
    let a = DeviceBuffer::from_slice(&gpu, AccessMode::ReadOnly, &[1.0f32; 16]).unwrap();
    let b = DeviceBuffer::from_slice(&gpu, AccessMode::ReadOnly, &[2.0f32; 16]).unwrap();

    // `C` (binding 3) is not supplied.
    let err = dispatch(
        &gpu,
        &kernel,
        &[KernelArg::F32(3.0), KernelArg::Buffer(&a), KernelArg::Buffer(&b)],
        GlobalSize::Linear(16),
    )
    .err()
    .expect("dispatch without all arguments must fail");
    assert_eq!(err.op, "set_kernel_args");
    assert_eq!(err.status, Status::InvalidKernelArgs);
    assert_eq!(err.status.code(), -52);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn saxpy_identity() {
    let gpu = gpu();
    let a: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let run = run_saxpy(&gpu, &KernelRegistry::builtin(), 1.0, &a, &[0.0; 10]).unwrap();
    assert_eq!(run.output, a);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn vec_mul_guards_tail() {
    let gpu = gpu();
    let n = 10;
    let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let sentinel = -7.5f32;
    let run = run_vec_mul(&gpu, &KernelRegistry::builtin(), &a, &a, &[sentinel; 64]).unwrap();
    for (i, &v) in run.output.iter().enumerate() {
        if i < n {
            assert_eq!(v, (i * i) as f32, "c[{i}]");
        } else {
            assert_eq!(v, sentinel, "c[{i}] must be untouched");
        }
    }
}

#[test]
#[ignore = "requires a GPU adapter"]
fn image_copy_is_bit_identical() {
    let gpu = gpu();
    let (w, h) = (1440u32, 1080u32);
    let plane: Vec<u8> = (0..w * h).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
    let run = run_image_copy(&gpu, &KernelRegistry::builtin(), &plane, w, h).unwrap();
    assert!(run.output == plane, "copy differs from input");
}

#[test]
#[ignore = "requires a GPU adapter"]
fn image_access_rules() {
    let gpu = gpu();
    let rw = DeviceImage::create(&gpu, AccessMode::ReadWrite, ImageFormat::Rgba8Uint, 4, 4, None);
    assert_eq!(rw.err().unwrap().status, Status::InvalidValue);
    let r8 = DeviceImage::create(&gpu, AccessMode::WriteOnly, ImageFormat::R8Uint, 4, 4, None);
    assert_eq!(r8.err().unwrap().status, Status::ImageFormatNotSupported);
    let zero = DeviceBuffer::allocate(&gpu, AccessMode::ReadOnly, 0);
    assert_eq!(zero.err().unwrap().status, Status::InvalidBufferSize);

    let input =
        DeviceImage::create(&gpu, AccessMode::ReadOnly, ImageFormat::Rgba8Uint, 4, 4, Some(&[7u8; 64])).unwrap();
    assert_eq!(input.mode(), AccessMode::ReadOnly);
    let output = DeviceImage::create(&gpu, AccessMode::WriteOnly, ImageFormat::R32Float, 4, 4, None).unwrap();
    assert_eq!(output.mode(), AccessMode::WriteOnly);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn broken_kernel_source_fails_build() {
    let gpu = gpu();
    let mut reg = KernelRegistry::builtin();
    reg.insert(KernelRegistry::VEC_MUL, ["fn vec_mul( {"]);
    match KernelProgram::from_registry(&gpu, &reg, KernelRegistry::VEC_MUL, &BuildOptions::default()) {
        Err(BuildError::BuildFailed { log }) => assert!(!log.is_empty()),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("broken source built"),
    }
}

// ===== Raster path =====

#[test]
#[ignore = "requires a GPU adapter"]
fn default_program_reflects_attributes_and_bindings() {
    let gpu = gpu();
    let program = ShaderProgram::default_program(&gpu).unwrap();
    assert_eq!(program.attribute_location("a_position"), Some(0));
    assert_eq!(program.attribute_location("a_tex_coord"), Some(1));
    assert_eq!(program.attribute_location("a_color"), None);
    assert_eq!(program.binding("uniforms"), Some((0, 0)));
    assert_eq!(program.binding("texture3"), Some((0, 4)));
    assert_eq!(program.binding("sampler0"), Some((0, 5)));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn vertex_syntax_error_yields_no_program() {
    let gpu = gpu();
    match ShaderProgram::compile(&gpu, "@vertex fn vs_main( {", DEFAULT_FRAGMENT_SHADER) {
        Err(CompileError::VertexCompileFailed(log)) => assert!(!log.is_empty()),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("broken vertex shader linked"),
    }
}

#[test]
#[ignore = "requires a GPU adapter"]
fn oversized_frame_is_rejected_without_abort() {
    let gpu = gpu();
    let max = gpu.limits.max_texture_dimension_2d;
    let mut compositor = ShaderCompositor::new();
    compositor.init_textures(&gpu);
    compositor.load_program(ShaderProgram::default_program(&gpu).unwrap()).unwrap();

    assert!(matches!(
        compositor.resize(max + 1, 1),
        Err(CompositorError::TooLarge { what: "viewport", .. })
    ));
    compositor.resize(8, 1).unwrap();

    let wide = FrameBuffer::new(FrameFormat::new(max + 1, 1, PixelLayout::Gray8));
    match compositor.render_frame(&gpu, &wide, max + 1, 1) {
        Err(CompositorError::TooLarge { what, width, max: limit, .. }) => {
            assert_eq!(what, "frame");
            assert_eq!(width, max + 1);
            assert_eq!(limit, max);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("oversized frame rendered"),
    }

    // The compositor is still usable afterwards.
    assert_eq!(compositor.state(), CompositorState::Ready);
    let small = FrameBuffer::new(FrameFormat::new(8, 1, PixelLayout::Gray8));
    let rb = compositor.render_frame(&gpu, &small, 8, 1).unwrap();
    assert_eq!(rb.pixels.len(), 8 * 4);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn fragment_syntax_error_yields_no_program() {
    let gpu = gpu();
    match ShaderProgram::compile(&gpu, DEFAULT_VERTEX_SHADER, "@fragment fn fs_main( {") {
        Err(CompileError::FragmentCompileFailed(log)) => assert!(!log.is_empty()),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("broken fragment shader linked"),
    }
}

#[test]
#[ignore = "requires a GPU adapter"]
fn readback_is_bottom_up() {
    let gpu = gpu();
    let (w, h) = (8u32, 8u32);
    let mut compositor = ShaderCompositor::new();
    compositor.init_textures(&gpu);
    compositor.load_program(ShaderProgram::default_program(&gpu).unwrap()).unwrap();
    compositor.resize(w, h).unwrap();

    // White top half, black bottom half.
    let fmt = FrameFormat::new(w, h, PixelLayout::Gray8);
    let data: Vec<u8> = (0..h).flat_map(|y| vec![if y < h / 2 { 255 } else { 0 }; w as usize]).collect();
    let frame = FrameBuffer::from_vec(fmt, data);
    let rb = compositor.render_frame(&gpu, &frame, w, h).unwrap();

    // Every quadrant shows the frame upright, so the bottom output row is
    // black and the top one white. Check the right half, which samples the
    // nearest-filtered units.
    let row = (w * 4) as usize;
    let first = &rb.pixels[..row];
    let last = &rb.pixels[rb.pixels.len() - row..];
    assert!(first[row / 2..].chunks(4).all(|p| p == [0, 0, 0, 255]), "first row must be the bottom");
    assert!(last[row / 2..].chunks(4).all(|p| p == [255, 255, 255, 255]), "last row must be the top");

    let mut flipped = rb.pixels.clone();
    flip_rows_in_place(&mut flipped, row);
    assert_eq!(&flipped[..row], last);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn session_streams_until_end() {
    let gpu = gpu();
    let fmt = FrameFormat::new(16, 8, PixelLayout::Rgb8);
    let stream = vec![90u8; fmt.frame_bytes() * 3];
    let config = PipelineConfig { frame: fmt, write_outputs: false, ..Default::default() };
    let source = FrameSource::from_reader(Cursor::new(stream), fmt.frame_bytes()).unwrap();

    let mut session = RenderSession::with_source(&gpu, config, source).unwrap();
    session.load_shader(None, None).unwrap();
    let mut frames = 0;
    while let Some(out) = session.step().unwrap() {
        assert_eq!(out.index, frames);
        assert_eq!(out.image.dimensions(), (16, 8));
        frames += 1;
    }
    assert_eq!(frames, 3);
    assert!(session.step().unwrap().is_none());
    assert_eq!(session.frames_rendered(), 3);
    assert!(session.total_timing().total() > std::time::Duration::ZERO);
}
