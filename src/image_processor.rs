use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::codec;
use crate::config::Config;
use crate::errors::{Result, SamError};
use crate::overlay::{overlay_mask, OverlayStyle};
use crate::sam::Sam;
use crate::session::{InferenceBackend, OrtBackend};

#[derive(Debug, Default)]
pub struct ProcessSummary {
    pub processed: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Writes a mask overlay for every image below the input directory.
pub struct ImageProcessor<B = OrtBackend> {
    sam: Sam<B>,
    config: Config,
    style: OverlayStyle,
}

impl<B: InferenceBackend> ImageProcessor<B> {
    pub fn new(sam: Sam<B>, config: Config) -> Self {
        let style = config.overlay_style();
        Self { sam, config, style }
    }

    pub fn process_directory(&self) -> Result<ProcessSummary> {
        let input_path = &self.config.input_dir;
        if !input_path.is_dir() {
            return Err(SamError::FileSystem {
                path: input_path.clone(),
                operation: "read input directory".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        let image_files = self.collect_image_files(input_path);
        if image_files.is_empty() {
            info!(input = %input_path.display(), "no images to process");
            return Ok(ProcessSummary::default());
        }

        let progress_bar = ProgressBar::new(image_files.len() as u64);
        progress_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        let failed: Vec<(PathBuf, String)> = image_files
            .par_iter()
            .progress_with(progress_bar.clone())
            .filter_map(|input_file| match self.process_single_image(input_file) {
                Ok(_) => None,
                Err(e) => {
                    warn!(path = %input_file.display(), error = %e, "image failed");
                    Some((input_file.clone(), e.to_string()))
                }
            })
            .collect();
        progress_bar.finish();

        let summary = ProcessSummary {
            processed: image_files.len() - failed.len(),
            failed,
        };
        info!(
            processed = summary.processed,
            failed = summary.failed.len(),
            "directory processed"
        );
        Ok(summary)
    }

    fn collect_image_files(&self, input_path: &Path) -> Vec<PathBuf> {
        WalkDir::new(input_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| ImageFormat::from_path(e.path()).is_ok())
            .map(|e| e.into_path())
            .collect()
    }

    /// Segment one file and write its overlay; returns the output path.
    pub fn process_single_image(&self, input_file: &Path) -> Result<PathBuf> {
        let image = codec::read_image(input_file)?;

        let mut output = self.sam.predict(&image)?;
        let overlay = overlay_mask(&image, output.mask_view()?, &self.style);
        output.close();
        let overlay = DynamicImage::ImageRgba8(overlay?);

        let format = self.config.output_format();
        let overlay = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(overlay.to_rgb8()),
            _ => overlay,
        };

        let output_file = self.output_path(input_file)?;
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent).map_err(|e| SamError::FileSystem {
                path: parent.to_path_buf(),
                operation: "create output directory".to_string(),
                source: e,
            })?;
        }
        codec::write_image(&output_file, &overlay, format)?;
        Ok(output_file)
    }

    pub fn output_path(&self, input_file: &Path) -> Result<PathBuf> {
        let relative = input_file
            .strip_prefix(&self.config.input_dir)
            .map_err(|_| SamError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is outside the input directory",
                ),
            })?;
        Ok(self
            .config
            .output_dir
            .join(relative)
            .with_extension(&self.config.format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockBackend;
    use crate::transforms::TransformPipeline;
    use clap::Parser;
    use image::{GenericImageView, Rgb, RgbImage};
    use std::ffi::OsStr;
    use tempfile::TempDir;

    fn processor(
        input_dir: &Path,
        output_dir: &Path,
        backend: MockBackend,
    ) -> ImageProcessor<MockBackend> {
        let args: [&OsStr; 5] = [
            OsStr::new("sam-overlay-rs"),
            input_dir.as_os_str(),
            output_dir.as_os_str(),
            OsStr::new("-m"),
            OsStr::new("unused.onnx"),
        ];
        let config = Config::parse_from(args);
        let sam = Sam::from_backend(backend, TransformPipeline::sam(16));
        ImageProcessor::new(sam, config)
    }

    #[test]
    fn test_relative_output_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let processor = processor(&input_dir, &temp_dir.path().join("out"), MockBackend::new());

        let output = processor.output_path(&input_dir.join("subdir/test.jpg"))?;
        assert_eq!(output, temp_dir.path().join("out/subdir/test.png"));
        assert!(processor.output_path(Path::new("/elsewhere/a.jpg")).is_err());
        Ok(())
    }

    #[test]
    fn test_process_directory_writes_overlays() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let output_dir = temp_dir.path().join("output");
        fs::create_dir_all(input_dir.join("nested"))?;

        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 10, Rgb([255, 255, 255])));
        image.save(input_dir.join("a.png"))?;
        image.save(input_dir.join("nested/b.png"))?;
        fs::write(input_dir.join("notes.txt"), b"skip me")?;
        fs::write(input_dir.join("broken.png"), b"not a png")?;

        let processor = processor(&input_dir, &output_dir, MockBackend::new());
        let summary = processor.process_directory()?;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].0.ends_with("broken.png"));

        let written = image::open(output_dir.join("nested/b.png"))?;
        assert_eq!(written.dimensions(), (16, 16));
        Ok(())
    }
}
