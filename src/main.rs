use anyhow::{bail, ensure, Result};
use clap::Parser;
use rayon::ThreadPoolBuilder;
use tracing::{error, info};

use sam_overlay_rs::{init_tracing, Config, ImageProcessor, IndicatifProgress, Sam};

fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing();

    ensure!(config.model_path.exists(), "Model path does not exist");
    ensure!(config.input_dir.is_dir(), "Input directory does not exist");

    if let Some(num_threads) = config.num_threads {
        ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()?;
    }

    let sam = Sam::with_progress(&config.sam_config(), &IndicatifProgress::new())?;
    let processor = ImageProcessor::new(sam, config);
    let summary = processor.process_directory()?;

    for (path, reason) in &summary.failed {
        error!(path = %path.display(), %reason, "failed");
    }
    if !summary.failed.is_empty() {
        bail!(
            "{} of {} images failed",
            summary.failed.len(),
            summary.processed + summary.failed.len()
        );
    }

    info!(processed = summary.processed, "done");
    Ok(())
}
