// session.rs — Render lifecycle: init / resize / step / load_shader.
//
// A `RenderSession` is what a host shell drives. It owns the compositor,
// the frame source and the single reusable frame buffer, and borrows the
// compute context for its whole life.
//
//   init ──▶ resize* ──▶ load_shader* ──▶ step ... step ──▶ (drop)
//
// `step` streams one frame end to end:
//
//   read_next_frame → render_frame (upload ×4, draw, read-back)
//     → flip (timed) → snapshots (optional)
//
// and returns `Ok(None)` once the source is exhausted.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::time::Duration;

use image::{DynamicImage, RgbaImage};
use log::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::frame::FrameBuffer;
use crate::gpu::compositor::{
    ShaderCompositor, ShaderProgram, DEFAULT_FRAGMENT_SHADER, DEFAULT_VERTEX_SHADER,
};
use crate::gpu::device::GpuDevice;
use crate::post::{self, FrameTiming};
use crate::source::FrameSource;

pub const INPUT_SNAPSHOT: &str = "input_frame.jpg";
pub const READBACK_SNAPSHOT: &str = "readback.jpg";
pub const FLIPPED_SNAPSHOT: &str = "readback_flipped.jpg";

/// Output of one `step`.
pub struct StepOutput {
    /// Zero-based index of the frame in the stream.
    pub index: u64,
    /// Composited frame, rows top-down.
    pub image: RgbaImage,
    pub timing: FrameTiming,
}

pub struct RenderSession<'g, R: Read = BufReader<File>> {
    gpu: &'g GpuDevice,
    config: PipelineConfig,
    compositor: ShaderCompositor,
    source: FrameSource<R>,
    frame: FrameBuffer,
    frames: u64,
    timing: FrameTiming,
}

impl<'g> RenderSession<'g> {
    /// Open the configured input stream and initialise the compositor.
    pub fn init(gpu: &'g GpuDevice, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let source = FrameSource::open(&config.input, config.frame.frame_bytes()).map_err(|e| {
            error!("init: {e}");
            PipelineError::from(e)
        })?;
        Self::with_source(gpu, config, source)
    }
}

impl<'g, R: Read> RenderSession<'g, R> {
    /// Initialise over an already opened source.
    pub fn with_source(gpu: &'g GpuDevice, config: PipelineConfig, source: FrameSource<R>) -> Result<Self> {
        config.validate()?;
        if config.write_outputs {
            fs::create_dir_all(&config.output_dir).map_err(|source| PipelineError::Io {
                context: format!("creating {}", config.output_dir.display()),
                source,
            })?;
        }

        let mut compositor = ShaderCompositor::new();
        compositor.init_textures(gpu);
        compositor.resize(config.frame.width, config.frame.height)?;

        let program = ShaderProgram::compile(gpu, DEFAULT_VERTEX_SHADER, DEFAULT_FRAGMENT_SHADER)
            .map_err(|e| {
                error!("init: built-in shader program rejected: {e}");
                PipelineError::from(e)
            })?;
        compositor.load_program(program)?;

        info!("render session: {} frames from {}", config.frame, config.input.display());
        Ok(RenderSession {
            gpu,
            frame: FrameBuffer::new(config.frame),
            config,
            compositor,
            source,
            frames: 0,
            timing: FrameTiming::default(),
        })
    }

    /// Set the output viewport.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.compositor.resize(width, height).map_err(|e| {
            error!("resize: {e}");
            PipelineError::from(e)
        })
    }

    /// Compile and install a new shader program. A `None` stage uses the
    /// built-in source. On failure the previous program stays installed.
    pub fn load_shader(&mut self, vertex: Option<&str>, fragment: Option<&str>) -> Result<()> {
        let vs = vertex.unwrap_or(DEFAULT_VERTEX_SHADER);
        let fs = fragment.unwrap_or(DEFAULT_FRAGMENT_SHADER);
        let program = ShaderProgram::compile(self.gpu, vs, fs).map_err(|e| {
            error!("load_shader: {e}");
            PipelineError::from(e)
        })?;
        self.compositor.load_program(program)?;
        info!(
            "load_shader: installed {} vertex / {} fragment stage",
            if vertex.is_some() { "custom" } else { "built-in" },
            if fragment.is_some() { "custom" } else { "built-in" }
        );
        Ok(())
    }

    /// Stream, composite and read back the next frame. `Ok(None)` at end
    /// of stream or once the frame limit is reached.
    pub fn step(&mut self) -> Result<Option<StepOutput>> {
        if self.config.max_frames.is_some_and(|max| self.frames >= max as u64) {
            return Ok(None);
        }
        let more = self.source.read_next_frame(&mut self.frame).map_err(|e| {
            error!("step: {e}");
            PipelineError::from(e)
        })?;
        if !more {
            return Ok(None);
        }

        let (w, h) = (self.frame.width(), self.frame.height());
        let readback = self.compositor.render_frame(self.gpu, &self.frame, w, h).map_err(|e| {
            error!("step {}: {e}", self.frames);
            PipelineError::from(e)
        })?;
        let bottom_up = post::to_rgba_image(readback.pixels, readback.width, readback.height)?;
        let (image, flip) = post::flip_timed(&bottom_up);

        let timing = FrameTiming {
            upload: readback.upload_time,
            draw: readback.draw_time,
            readback: readback.readback_time,
            flip,
        };
        debug!(
            "frame {}: read-back {:.3} ms, flip {:.3} ms",
            self.frames,
            ms(timing.readback),
            ms(timing.flip)
        );

        if self.config.write_outputs {
            self.write_snapshots(bottom_up, &image)?;
        }

        let index = self.frames;
        self.frames += 1;
        self.timing.accumulate(&timing);
        Ok(Some(StepOutput { index, image, timing }))
    }

    fn write_snapshots(&self, bottom_up: RgbaImage, flipped: &RgbaImage) -> Result<()> {
        let input = post::frame_to_image(&self.frame)?;
        post::encode(&input, &self.config.output_path(INPUT_SNAPSHOT))?;
        post::encode(&DynamicImage::ImageRgba8(bottom_up), &self.config.output_path(READBACK_SNAPSHOT))?;
        post::encode(
            &DynamicImage::ImageRgba8(flipped.clone()),
            &self.config.output_path(FLIPPED_SNAPSHOT),
        )?;
        Ok(())
    }

    /// Frames composited so far.
    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    /// Timings summed over all frames.
    pub fn total_timing(&self) -> FrameTiming {
        self.timing
    }

    pub fn compositor(&self) -> &ShaderCompositor {
        &self.compositor
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Log frame count and mean per-stage timings.
    pub fn log_summary(&self) {
        if self.frames == 0 {
            info!("no frames rendered");
            return;
        }
        let n = self.frames as u32;
        let t = &self.timing;
        info!(
            "{} frames: mean upload {:.3} ms, draw {:.3} ms, read-back {:.3} ms, flip {:.3} ms",
            self.frames,
            ms(t.upload / n),
            ms(t.draw / n),
            ms(t.readback / n),
            ms(t.flip / n)
        );
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}
