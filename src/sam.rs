use image::DynamicImage;
use tracing::{debug, info};

use crate::config::SamConfig;
use crate::errors::Result;
use crate::output::{OutputExtractor, SamRawOutput};
use crate::progress::{LoadProgress, NoProgress};
use crate::session::{InferenceBackend, ModelSession, OrtBackend, SessionState};
use crate::transforms::TransformPipeline;

/// Single-image, single-mask Segment Anything predictor.
///
/// Construction loads the model and is slow; build one at startup and share it (`Sam` is
/// `Send + Sync`). `predict` calls from several threads are serialized at the engine
/// boundary, see [`ModelSession`].
pub struct Sam<B = OrtBackend> {
    pipeline: TransformPipeline,
    session: ModelSession<B>,
}

impl Sam<OrtBackend> {
    pub fn new(config: &SamConfig) -> Result<Self> {
        Self::with_progress(config, &NoProgress)
    }

    pub fn with_progress(config: &SamConfig, progress: &dyn LoadProgress) -> Result<Self> {
        let sam = config.pipeline().and_then(|pipeline| {
            let session = ModelSession::load(|| OrtBackend::load(config, progress))?;
            Ok(Self { pipeline, session })
        });
        progress.done(sam.is_ok());
        sam
    }
}

impl<B: InferenceBackend> Sam<B> {
    /// Compose an already loaded backend with a preprocessing pipeline.
    pub fn from_backend(backend: B, pipeline: TransformPipeline) -> Self {
        Self {
            pipeline,
            session: ModelSession::new(backend),
        }
    }

    /// Segment `image`.
    ///
    /// The returned output is owned by the caller, who releases it with
    /// [`SamRawOutput::close`] (or by dropping it). Errors keep their original kind.
    pub fn predict(&self, image: &DynamicImage) -> Result<SamRawOutput> {
        let input = self.pipeline.apply(image)?;
        debug!(shape = ?input.shape()?, "image encoded");
        let output = self.session.infer(&input, OutputExtractor::extract)?;
        debug!(mask = ?output.mask().shape()?, "prediction complete");
        Ok(output)
    }

    pub const fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Release the model. Outputs returned earlier stay valid.
    pub fn dispose(&self) {
        self.session.dispose();
        info!("sam predictor disposed");
    }
}
