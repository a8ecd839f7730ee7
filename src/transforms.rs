//! Image to tensor preprocessing.
//!
//! A [`TransformPipeline`] is an ordered, immutable list of [`Transform`] stages. It is
//! validated once when built: resizes run on the decoded image, a single `ToTensor` turns the
//! image into a CHW `f32` tensor in `[0, 1]`, and normalisation runs on that tensor.

use std::borrow::Cow;

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageBuffer, Pixel, Primitive, Rgb};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use tracing::debug;

use crate::errors::{Result, SamError};
use crate::tensor::Tensor;

/// ImageNet channel means for `[0, 1]` scaled input.
pub const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations for `[0, 1]` scaled input.
pub const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// Side length the SAM image encoder is exported with.
pub const DEFAULT_IMAGE_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Both sides become `size`.
    #[default]
    Exact,
    /// Aspect ratio is kept and the longer side becomes `size`.
    LongestSide,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Resize {
        size: u32,
        mode: ResizeMode,
        filter: FilterType,
    },
    ToTensor,
    Normalize {
        mean: [f32; 3],
        std: [f32; 3],
    },
}

impl Transform {
    pub const fn resize(size: u32) -> Self {
        Self::Resize {
            size,
            mode: ResizeMode::Exact,
            filter: FilterType::Triangle,
        }
    }

    pub const fn imagenet_normalize() -> Self {
        Self::Normalize {
            mean: IMAGE_MEAN,
            std: IMAGE_STD,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Resize { .. } => "resize",
            Self::ToTensor => "to_tensor",
            Self::Normalize { .. } => "normalize",
        }
    }
}

/// Intermediate value flowing between stages.
enum Stage<'a> {
    Image(Cow<'a, DynamicImage>),
    Tensor(Array3<f32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformPipeline {
    transforms: Vec<Transform>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::sam(DEFAULT_IMAGE_SIZE)
    }
}

impl TransformPipeline {
    /// Validate and freeze an ordered list of transforms.
    pub fn new(transforms: Vec<Transform>) -> Result<Self> {
        let to_tensor_positions: Vec<usize> = transforms
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t, Transform::ToTensor))
            .map(|(i, _)| i)
            .collect();
        let [to_tensor] = to_tensor_positions[..] else {
            return Err(config_error(format!(
                "pipeline needs exactly one to_tensor stage, found {}",
                to_tensor_positions.len()
            )));
        };

        for (i, transform) in transforms.iter().enumerate() {
            match transform {
                Transform::Resize { size, .. } => {
                    if i > to_tensor {
                        return Err(config_error("resize must run before to_tensor"));
                    }
                    if *size == 0 {
                        return Err(config_error("resize target must be greater than 0"));
                    }
                }
                Transform::Normalize { mean, std } => {
                    if i < to_tensor {
                        return Err(config_error("normalize must run after to_tensor"));
                    }
                    validate_normalize(mean, std)?;
                }
                Transform::ToTensor => {}
            }
        }

        Ok(Self { transforms })
    }

    /// The reference SAM preprocessing: exact resize, tensorize, ImageNet normalisation.
    pub fn sam(size: u32) -> Self {
        Self {
            transforms: vec![
                Transform::resize(size),
                Transform::ToTensor,
                Transform::imagenet_normalize(),
            ],
        }
    }

    pub fn builder() -> TransformPipelineBuilder {
        TransformPipelineBuilder::default()
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Side length of the last exact resize, which fixes the mask resolution.
    pub fn target_size(&self) -> Option<u32> {
        self.transforms.iter().rev().find_map(|t| match t {
            Transform::Resize {
                size,
                mode: ResizeMode::Exact,
                ..
            } => Some(*size),
            _ => None,
        })
    }

    /// Encode an image into a CHW tensor.
    pub fn apply(&self, image: &DynamicImage) -> Result<Tensor<f32>> {
        validate_image(image)?;

        let mut stage = Stage::Image(Cow::Borrowed(image));
        for transform in &self.transforms {
            stage = apply_transform(transform, stage)?;
            if let Stage::Tensor(tensor) = &stage {
                debug!(transform = transform.name(), shape = ?tensor.shape(), "transform applied");
            }
        }

        match stage {
            Stage::Tensor(tensor) => Ok(Tensor::new(tensor.into_dyn())),
            Stage::Image(_) => Err(config_error("pipeline ended without a to_tensor stage")),
        }
    }
}

#[derive(Debug, Default)]
pub struct TransformPipelineBuilder {
    transforms: Vec<Transform>,
}

impl TransformPipelineBuilder {
    pub fn add(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn build(self) -> Result<TransformPipeline> {
        TransformPipeline::new(self.transforms)
    }
}

fn apply_transform<'a>(transform: &Transform, stage: Stage<'a>) -> Result<Stage<'a>> {
    match (transform, stage) {
        (Transform::Resize { size, mode, filter }, Stage::Image(image)) => {
            let resized = match mode {
                ResizeMode::Exact => image.resize_exact(*size, *size, *filter),
                ResizeMode::LongestSide => image.resize(*size, *size, *filter),
            };
            Ok(Stage::Image(Cow::Owned(resized)))
        }
        (Transform::ToTensor, Stage::Image(image)) => to_tensor(&image).map(Stage::Tensor),
        (Transform::Normalize { mean, std }, Stage::Tensor(tensor)) => {
            Ok(Stage::Tensor(normalize(tensor, mean, std)))
        }
        (transform, _) => Err(config_error(format!(
            "{} received the wrong kind of input",
            transform.name()
        ))),
    }
}

fn validate_image(image: &DynamicImage) -> Result<()> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(SamError::InvalidImage {
            reason: format!("image has zero size ({width}x{height})"),
        });
    }
    let channels = image.color().channel_count();
    if channels != 3 {
        return Err(SamError::InvalidImage {
            reason: format!("expected 3 color channels, got {channels}"),
        });
    }
    Ok(())
}

fn validate_normalize(mean: &[f32; 3], std: &[f32; 3]) -> Result<()> {
    if let Some((i, m)) = mean.iter().enumerate().find(|(_, m)| !m.is_finite()) {
        return Err(config_error(format!("mean at index {i} is not finite: {m}")));
    }
    if let Some((i, s)) = std
        .iter()
        .enumerate()
        .find(|(_, s)| !s.is_finite() || **s <= 0.0)
    {
        return Err(config_error(format!(
            "standard deviation at index {i} must be finite and greater than 0, got {s}"
        )));
    }
    Ok(())
}

fn to_tensor(image: &DynamicImage) -> Result<Array3<f32>> {
    match image {
        DynamicImage::ImageRgb8(buffer) => Ok(tensorize(buffer)),
        DynamicImage::ImageRgb16(buffer) => Ok(tensorize(buffer)),
        DynamicImage::ImageRgb32F(buffer) => Ok(tensorize(buffer)),
        other => Err(SamError::InvalidImage {
            reason: format!("unsupported color type {:?}", other.color()),
        }),
    }
}

/// HWC pixels to a CHW tensor scaled into `[0, 1]`.
fn tensorize<S>(image: &ImageBuffer<Rgb<S>, Vec<S>>) -> Array3<f32>
where
    Rgb<S>: Pixel<Subpixel = S>,
    S: Into<f32> + Primitive + 'static,
{
    let max: f32 = S::DEFAULT_MAX_VALUE.into();
    image
        .as_ndarray3()
        .mapv(|v| <S as Into<f32>>::into(v) / max)
}

fn normalize(mut tensor: Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    for (c, mut channel) in tensor.axis_iter_mut(Axis(0)).enumerate() {
        let (m, s) = (mean[c], std[c]);
        channel.mapv_inplace(|v| (v - m) / s);
    }
    tensor
}

fn config_error(message: impl Into<String>) -> SamError {
    SamError::Configuration {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, RgbaImage};
    use proptest::prelude::*;

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 128, 0])
            } else {
                Rgb([0, 64, 255])
            }
        }))
    }

    #[test]
    fn test_sam_pipeline_produces_chw_target_size() -> Result<()> {
        let pipeline = TransformPipeline::sam(64);
        let tensor = pipeline.apply(&checkerboard(100, 30))?;
        assert_eq!(tensor.shape()?, &[3, 64, 64]);
        assert_eq!(pipeline.target_size(), Some(64));
        Ok(())
    }

    #[test]
    fn test_longest_side_keeps_aspect_ratio() -> Result<()> {
        let pipeline = TransformPipeline::builder()
            .add(Transform::Resize {
                size: 50,
                mode: ResizeMode::LongestSide,
                filter: FilterType::Nearest,
            })
            .add(Transform::ToTensor)
            .build()?;
        let tensor = pipeline.apply(&checkerboard(100, 40))?;
        assert_eq!(tensor.shape()?, &[3, 20, 50]);
        assert_eq!(pipeline.target_size(), None);
        Ok(())
    }

    #[test]
    fn test_to_tensor_scales_into_unit_range() -> Result<()> {
        let pipeline = TransformPipeline::new(vec![Transform::ToTensor])?;
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 1, Rgb([255, 0, 51])));
        let tensor = pipeline.apply(&image)?;
        let view = tensor.view()?;
        assert_eq!(view[[0, 0, 0]], 1.0);
        assert_eq!(view[[1, 0, 1]], 0.0);
        assert!((view[[2, 0, 0]] - 0.2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_imagenet_normalize_values() -> Result<()> {
        let pipeline = TransformPipeline::new(vec![
            Transform::ToTensor,
            Transform::imagenet_normalize(),
        ])?;
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([255, 255, 255])));
        let tensor = pipeline.apply(&image)?;
        let view = tensor.view()?;
        for c in 0..3 {
            let expected = (1.0 - IMAGE_MEAN[c]) / IMAGE_STD[c];
            assert!((view[[c, 0, 0]] - expected).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_resize_is_deterministic() -> Result<()> {
        let pipeline = TransformPipeline::sam(32);
        let image = checkerboard(77, 51);
        let first = pipeline.apply(&image)?.into_array()?;
        let second = pipeline.apply(&image)?.into_array()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_zero_sized_image_is_rejected() {
        let pipeline = TransformPipeline::default();
        for (w, h) in [(0, 0), (0, 10), (10, 0)] {
            let image = DynamicImage::new_rgb8(w, h);
            assert!(matches!(
                pipeline.apply(&image),
                Err(SamError::InvalidImage { .. })
            ));
        }
    }

    #[test]
    fn test_non_rgb_image_is_rejected() {
        let pipeline = TransformPipeline::default();
        let rgba = DynamicImage::ImageRgba8(RgbaImage::new(4, 4));
        let luma = DynamicImage::new_luma8(4, 4);
        assert!(matches!(
            pipeline.apply(&rgba),
            Err(SamError::InvalidImage { .. })
        ));
        assert!(matches!(
            pipeline.apply(&luma),
            Err(SamError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_pipeline_order_is_validated() {
        let cases = vec![
            vec![],
            vec![Transform::ToTensor, Transform::ToTensor],
            vec![Transform::ToTensor, Transform::resize(8)],
            vec![Transform::imagenet_normalize(), Transform::ToTensor],
            vec![Transform::resize(0), Transform::ToTensor],
            vec![
                Transform::ToTensor,
                Transform::Normalize {
                    mean: IMAGE_MEAN,
                    std: [0.2, 0.0, 0.2],
                },
            ],
        ];
        for transforms in cases {
            assert!(matches!(
                TransformPipeline::new(transforms),
                Err(SamError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn test_input_image_is_untouched() -> Result<()> {
        let image = checkerboard(10, 10);
        let before = image.clone();
        TransformPipeline::sam(16).apply(&image)?;
        assert_eq!(image, before);
        Ok(())
    }

    proptest! {
        #[test]
        fn normalize_with_zero_mean_unit_std_is_identity(
            values in proptest::collection::vec(-10.0f32..10.0, 12)
        ) {
            let tensor = Array3::from_shape_vec((3, 2, 2), values).unwrap();
            let normalized = normalize(tensor.clone(), &[0.0; 3], &[1.0; 3]);
            prop_assert_eq!(normalized, tensor);
        }
    }
}
