//! Mask to overlay rendering.
//!
//! Masks are rendered into packed ARGB pixels (`a << 24 | r << 16 | g << 8 | b`), row-major,
//! then alpha-composited over a copy of the source image resized to the mask resolution.

use image::{imageops, imageops::FilterType, DynamicImage, Rgba, RgbaImage};
use ndarray::ArrayView2;

use crate::errors::{Result, SamError};

/// Fully transparent black.
pub const TRANSPARENT: u32 = 0x0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayStyle {
    color: [u8; 3],
    alpha: u8,
}

impl Default for OverlayStyle {
    /// Translucent blue.
    fn default() -> Self {
        Self::new([0, 0, 255], 120)
    }
}

impl OverlayStyle {
    pub const fn new(color: [u8; 3], alpha: u8) -> Self {
        Self { color, alpha }
    }

    pub const fn with_alpha(mut self, alpha: u8) -> Self {
        self.alpha = alpha;
        self
    }

    pub const fn color(&self) -> [u8; 3] {
        self.color
    }

    pub const fn alpha(&self) -> u8 {
        self.alpha
    }

    pub const fn argb(&self) -> u32 {
        let [red, green, blue] = self.color;
        (self.alpha as u32) << 24 | (red as u32) << 16 | (green as u32) << 8 | blue as u32
    }
}

/// Render a `[height, width]` mask into `height * width` ARGB pixels.
///
/// Pixel `(row, col)` lands at `row * width + col`. Set pixels take the style colour, the
/// rest are [`TRANSPARENT`].
pub fn render_mask(mask: ArrayView2<'_, bool>, style: &OverlayStyle) -> Vec<u32> {
    let (height, width) = mask.dim();
    let color = style.argb();
    let mut pixels = vec![TRANSPARENT; height * width];
    for ((row, col), &set) in mask.indexed_iter() {
        if set {
            pixels[row * width + col] = color;
        }
    }
    pixels
}

pub const fn unpack_argb(pixel: u32) -> Rgba<u8> {
    Rgba([
        (pixel >> 16) as u8,
        (pixel >> 8) as u8,
        pixel as u8,
        (pixel >> 24) as u8,
    ])
}

/// Mask size as image `(width, height)`; masks wider or taller than `u32::MAX` are rejected.
pub fn mask_dimensions(mask: ArrayView2<'_, bool>) -> Result<(u32, u32)> {
    let (height, width) = mask.dim();
    match (u32::try_from(width), u32::try_from(height)) {
        (Ok(width), Ok(height)) => Ok((width, height)),
        _ => Err(SamError::malformed(format!(
            "mask of {width}x{height} does not fit an image"
        ))),
    }
}

/// Build an RGBA image from packed ARGB pixels.
pub fn pixels_to_image(pixels: &[u32], width: u32, height: u32) -> Result<RgbaImage> {
    if pixels.len() != width as usize * height as usize {
        return Err(SamError::ShapeMismatch {
            expected: (width, height),
            actual: (u32::try_from(pixels.len()).unwrap_or(u32::MAX), 1),
        });
    }
    let stride = width as usize;
    Ok(RgbaImage::from_fn(width, height, |x, y| {
        unpack_argb(pixels[y as usize * stride + x as usize])
    }))
}

/// Blend `overlay` over `base` with the "over" operator.
pub fn composite(base: &mut RgbaImage, overlay: &RgbaImage) -> Result<()> {
    if base.dimensions() != overlay.dimensions() {
        return Err(SamError::ShapeMismatch {
            expected: base.dimensions(),
            actual: overlay.dimensions(),
        });
    }
    imageops::overlay(base, overlay, 0, 0);
    Ok(())
}

/// Render `mask` and composite it onto `base`, which must already have the mask's size.
pub fn render_onto(
    base: &mut RgbaImage,
    mask: ArrayView2<'_, bool>,
    style: &OverlayStyle,
) -> Result<()> {
    let (width, height) = mask_dimensions(mask)?;
    if base.dimensions() != (width, height) {
        return Err(SamError::ShapeMismatch {
            expected: base.dimensions(),
            actual: (width, height),
        });
    }

    let pixels = render_mask(mask, style);
    let overlay = pixels_to_image(&pixels, width, height)?;
    composite(base, &overlay)
}

/// Resize a copy of `image` to the mask resolution and draw the mask over it.
pub fn overlay_mask(
    image: &DynamicImage,
    mask: ArrayView2<'_, bool>,
    style: &OverlayStyle,
) -> Result<RgbaImage> {
    let (width, height) = mask_dimensions(mask)?;
    let mut base = image
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgba8();
    render_onto(&mut base, mask, style)?;
    Ok(base)
}
