// config.rs — Pipeline configuration.
//
// Plain structs with `Default`; callers override fields with
// `..Default::default()`. Command-line overrides are parsed by `from_args`
// (`--key value` pairs, plus one optional positional input path). Nothing
// is persisted.

use std::path::PathBuf;

use thiserror::Error;

use crate::frame::{FrameFormat, PixelLayout};
use crate::gpu::device::DeviceKind;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{what} must be non-zero")]
    Zero { what: &'static str },
    #[error("compute image width {0} must be a multiple of 4")]
    UnpackedWidth(u32),
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("option '{0}' needs a value")]
    MissingValue(String),
    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue { key: String, value: String, reason: String },
}

/// Settings of the compute-kernel image path.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeConfig {
    /// Width of the 8-bit plane in pixels.
    pub image_width: u32,
    pub image_height: u32,
    /// Raw Y-only plane file. A synthetic gradient is used when absent.
    pub input: Option<PathBuf>,
    /// File name of the raw copy, inside `output_dir`.
    pub output: PathBuf,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        ComputeConfig {
            image_width: 1440,
            image_height: 1080,
            input: None,
            output: PathBuf::from("image_copy.yuv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Format of every frame in the raw input stream.
    pub frame: FrameFormat,
    /// Raw frame stream.
    pub input: PathBuf,
    /// Directory for snapshots and raw dumps.
    pub output_dir: PathBuf,
    pub device_kind: DeviceKind,
    /// WGSL vertex shader file; the built-in shader when `None`.
    pub vertex_shader: Option<PathBuf>,
    /// WGSL fragment shader file; the built-in shader when `None`.
    pub fragment_shader: Option<PathBuf>,
    /// Stop after this many frames.
    pub max_frames: Option<usize>,
    /// Write the per-step image snapshots.
    pub write_outputs: bool,
    pub compute: ComputeConfig,
}

impl Default for PipelineConfig {
    /// 1920×1080 RGB24 frames, the capture format of the raw streams.
    fn default() -> Self {
        PipelineConfig {
            frame: FrameFormat::new(1920, 1080, PixelLayout::Rgb8),
            input: PathBuf::from("frames.rgb"),
            output_dir: PathBuf::from("output"),
            device_kind: DeviceKind::Gpu,
            vertex_shader: None,
            fragment_shader: None,
            max_frames: None,
            write_outputs: true,
            compute: ComputeConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame.width == 0 {
            return Err(ConfigError::Zero { what: "frame width" });
        }
        if self.frame.height == 0 {
            return Err(ConfigError::Zero { what: "frame height" });
        }
        if self.compute.image_width == 0 {
            return Err(ConfigError::Zero { what: "compute image width" });
        }
        if self.compute.image_height == 0 {
            return Err(ConfigError::Zero { what: "compute image height" });
        }
        if self.compute.image_width % 4 != 0 {
            return Err(ConfigError::UnpackedWidth(self.compute.image_width));
        }
        if self.max_frames == Some(0) {
            return Err(ConfigError::Zero { what: "max frames" });
        }
        Ok(())
    }

    /// Defaults overridden by command-line arguments (program name
    /// excluded).
    ///
    /// ```text
    /// [INPUT] [--width N] [--height N] [--channels 1|3|4] [--device gpu|cpu|other|any]
    ///         [--output DIR] [--vertex FILE] [--fragment FILE] [--frames N] [--no-write]
    ///         [--compute-width N] [--compute-height N] [--compute-input FILE]
    ///         [--compute-output FILE]
    /// ```
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cfg = PipelineConfig::default();
        let mut it = args.into_iter().map(Into::into);

        while let Some(arg) = it.next() {
            if !arg.starts_with("--") {
                cfg.input = PathBuf::from(arg);
                continue;
            }
            if arg == "--no-write" {
                cfg.write_outputs = false;
                continue;
            }
            let value = it.next().ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
            match arg.as_str() {
                "--width" => cfg.frame.width = parse_num(&arg, &value)?,
                "--height" => cfg.frame.height = parse_num(&arg, &value)?,
                "--channels" => {
                    let channels: usize = parse_num(&arg, &value)?;
                    cfg.frame.layout = PixelLayout::from_channels(channels).ok_or_else(|| {
                        ConfigError::InvalidValue {
                            key: arg.clone(),
                            value: value.clone(),
                            reason: "expected 1, 3 or 4".into(),
                        }
                    })?;
                }
                "--device" => {
                    cfg.device_kind = value.parse().map_err(|reason| ConfigError::InvalidValue {
                        key: arg.clone(),
                        value: value.clone(),
                        reason,
                    })?;
                }
                "--output" => cfg.output_dir = PathBuf::from(value),
                "--vertex" => cfg.vertex_shader = Some(PathBuf::from(value)),
                "--fragment" => cfg.fragment_shader = Some(PathBuf::from(value)),
                "--frames" => cfg.max_frames = Some(parse_num(&arg, &value)?),
                "--compute-width" => cfg.compute.image_width = parse_num(&arg, &value)?,
                "--compute-height" => cfg.compute.image_height = parse_num(&arg, &value)?,
                "--compute-input" => cfg.compute.input = Some(PathBuf::from(value)),
                "--compute-output" => cfg.compute.output = PathBuf::from(value),
                _ => return Err(ConfigError::UnknownOption(arg)),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Path of an artifact inside the output directory.
    pub fn output_path(&self, name: impl AsRef<std::path::Path>) -> PathBuf {
        self.output_dir.join(name)
    }
}

fn parse_num<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.frame.frame_bytes(), 1920 * 1080 * 3);
        assert_eq!(cfg.compute.image_width, 1440);
        assert_eq!(cfg.device_kind, DeviceKind::Gpu);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_args_overrides() {
        let cfg = PipelineConfig::from_args([
            "clip.gray", "--width", "640", "--height", "480", "--channels", "1", "--device", "cpu",
            "--frames", "3", "--no-write",
        ])
        .unwrap();
        assert_eq!(cfg.input, PathBuf::from("clip.gray"));
        assert_eq!(cfg.frame, FrameFormat::new(640, 480, PixelLayout::Gray8));
        assert_eq!(cfg.device_kind, DeviceKind::Cpu);
        assert_eq!(cfg.max_frames, Some(3));
        assert!(!cfg.write_outputs);
    }

    #[test]
    fn test_from_args_errors() {
        assert_eq!(
            PipelineConfig::from_args(["--bogus", "1"]),
            Err(ConfigError::UnknownOption("--bogus".into()))
        );
        assert_eq!(
            PipelineConfig::from_args(["--width"]),
            Err(ConfigError::MissingValue("--width".into()))
        );
        assert!(matches!(
            PipelineConfig::from_args(["--channels", "2"]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            PipelineConfig::from_args(["--width", "0"]),
            Err(ConfigError::Zero { what: "frame width" })
        );
    }

    #[test]
    fn test_compute_width_must_pack() {
        let cfg = PipelineConfig {
            compute: ComputeConfig { image_width: 1442, ..Default::default() },
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::UnpackedWidth(1442)));
    }
}
