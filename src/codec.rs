//! File-format boundary: bytes in, decoded RGB images out, and back.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat};

use crate::errors::{Result, SamError};

/// Decode encoded image bytes into an 8-bit RGB image.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(bytes).map_err(|e| SamError::Codec {
        operation: "decode".to_string(),
        source: e,
    })?;
    Ok(DynamicImage::ImageRgb8(image.into_rgb8()))
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, format)
        .map_err(|e| SamError::Codec {
            operation: format!("encode as {format:?}"),
            source: e,
        })?;
    Ok(bytes.into_inner())
}

pub fn read_image(path: &Path) -> Result<DynamicImage> {
    let bytes = fs::read(path).map_err(|e| SamError::FileSystem {
        path: path.to_path_buf(),
        operation: "read image".to_string(),
        source: e,
    })?;
    decode(&bytes)
}

pub fn write_image(path: &Path, image: &DynamicImage, format: ImageFormat) -> Result<()> {
    let bytes = encode(image, format)?;
    fs::write(path, bytes).map_err(|e| SamError::FileSystem {
        path: path.to_path_buf(),
        operation: "write image".to_string(),
        source: e,
    })
}
