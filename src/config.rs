use clap::{Parser, ValueEnum};
use image::ImageFormat;
use std::path::PathBuf;

use crate::errors::Result;
use crate::overlay::OverlayStyle;
use crate::transforms::{
    ResizeMode, Transform, TransformPipeline, DEFAULT_IMAGE_SIZE, IMAGE_MEAN, IMAGE_STD,
};

/// ONNX Runtime execution provider used for the forward pass.
///
/// Accelerated providers fall back to the CPU provider when they cannot be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Engine {
    #[default]
    Cpu,
    Cuda,
    #[value(name = "tensorrt")]
    TensorRt,
}

/// Session-level settings. Preprocessing constants are fixed for the lifetime of the session
/// built from this configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SamConfig {
    pub model_path: PathBuf,
    pub engine: Engine,
    pub device_id: i32,
    pub intra_threads: Option<usize>,
    pub image_size: u32,
    pub resize_mode: ResizeMode,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub warm_up: bool,
}

impl SamConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            engine: Engine::default(),
            device_id: 0,
            intra_threads: None,
            image_size: DEFAULT_IMAGE_SIZE,
            resize_mode: ResizeMode::Exact,
            mean: IMAGE_MEAN,
            std: IMAGE_STD,
            warm_up: true,
        }
    }

    pub fn with_engine(mut self, engine: Engine, device_id: i32) -> Self {
        self.engine = engine;
        self.device_id = device_id;
        self
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = Some(threads);
        self
    }

    pub fn with_image_size(mut self, image_size: u32, mode: ResizeMode) -> Self {
        self.image_size = image_size;
        self.resize_mode = mode;
        self
    }

    pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.mean = mean;
        self.std = std;
        self
    }

    pub fn with_warm_up(mut self, warm_up: bool) -> Self {
        self.warm_up = warm_up;
        self
    }

    /// Build the preprocessing pipeline described by this configuration.
    pub fn pipeline(&self) -> Result<TransformPipeline> {
        TransformPipeline::builder()
            .add(Transform::Resize {
                size: self.image_size,
                mode: self.resize_mode,
                filter: image::imageops::FilterType::Triangle,
            })
            .add(Transform::ToTensor)
            .add(Transform::Normalize {
                mean: self.mean,
                std: self.std,
            })
            .build()
    }
}

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(short, long)]
    pub model_path: PathBuf,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(short, long, value_enum, default_value_t = Engine::Cpu)]
    pub engine: Engine,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short = 's', long, default_value_t = DEFAULT_IMAGE_SIZE)]
    pub image_size: u32,

    #[arg(long, default_value_t = 120)]
    pub alpha: u8,

    #[arg(short = 't', long)]
    pub num_threads: Option<usize>,

    #[arg(long)]
    pub no_warm_up: bool,
}

impl Config {
    pub fn sam_config(&self) -> SamConfig {
        SamConfig::new(&self.model_path)
            .with_engine(self.engine, self.device_id)
            .with_image_size(self.image_size, ResizeMode::Exact)
            .with_warm_up(!self.no_warm_up)
    }

    pub fn overlay_style(&self) -> OverlayStyle {
        OverlayStyle::default().with_alpha(self.alpha)
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
