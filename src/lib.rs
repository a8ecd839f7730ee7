//! Segment Anything inference with mask overlay rendering.
//!
//! The pipeline decodes an image, resizes and normalises it into a CHW tensor, runs a SAM
//! model through ONNX Runtime and detaches the three outputs (IoU prediction, low resolution
//! logits and the binary mask) from the engine. The mask can then be drawn over the source
//! image with [`overlay_mask`].

pub mod codec;
pub mod config;
pub mod errors;
pub mod image_processor;
pub mod output;
pub mod overlay;
pub mod progress;
pub mod sam;
pub mod session;
pub mod tensor;
pub mod transforms;

pub mod mocks;

pub use config::{Config, Engine, SamConfig};
pub use errors::{Result, SamError};
pub use image_processor::{ImageProcessor, ProcessSummary};
pub use output::{OutputExtractor, SamRawOutput};
pub use overlay::{overlay_mask, render_mask, OverlayStyle};
pub use progress::{IndicatifProgress, LoadProgress, LoadStage, NoProgress};
pub use sam::Sam;
pub use session::{InferenceBackend, ModelSession, OrtBackend, RawTensor, SessionState};
pub use tensor::Tensor;
pub use transforms::{ResizeMode, Transform, TransformPipeline, IMAGE_MEAN, IMAGE_STD};

/// Install a `tracing` subscriber that honours `RUST_LOG`.
///
/// Panics if a global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
