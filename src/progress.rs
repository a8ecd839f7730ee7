use std::fmt;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    ResolveArtifact,
    BuildSession,
    WarmUp,
}

impl LoadStage {
    pub const ALL: [LoadStage; 3] = [Self::ResolveArtifact, Self::BuildSession, Self::WarmUp];
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ResolveArtifact => "resolving model artifact",
            Self::BuildSession => "building inference session",
            Self::WarmUp => "warming up",
        };
        f.write_str(label)
    }
}

/// Observer notified while a model loads. Purely informational.
pub trait LoadProgress: Send + Sync {
    fn begin(&self, stage: LoadStage);

    fn finish(&self, stage: LoadStage);

    /// Called once when loading ends, successfully or not.
    fn done(&self, _loaded: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl LoadProgress for NoProgress {
    fn begin(&self, _stage: LoadStage) {}

    fn finish(&self, _stage: LoadStage) {}
}

/// Terminal spinner for model loading.
pub struct IndicatifProgress {
    progress_bar: ProgressBar,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let progress_bar = ProgressBar::new(LoadStage::ALL.len() as u64);
        progress_bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { progress_bar }
    }

    pub fn hidden() -> Self {
        Self {
            progress_bar: ProgressBar::hidden(),
        }
    }

    pub fn position(&self) -> u64 {
        self.progress_bar.position()
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProgress for IndicatifProgress {
    fn begin(&self, stage: LoadStage) {
        self.progress_bar.set_message(stage.to_string());
        self.progress_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    fn finish(&self, _stage: LoadStage) {
        self.progress_bar.inc(1);
    }

    fn done(&self, loaded: bool) {
        if loaded {
            self.progress_bar.finish_with_message("model ready");
        } else {
            self.progress_bar.abandon_with_message("model load failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_counts_stages() {
        let progress = IndicatifProgress::hidden();
        for stage in LoadStage::ALL {
            progress.begin(stage);
            progress.finish(stage);
        }
        progress.done(true);
        assert_eq!(progress.position(), 3);
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(LoadStage::WarmUp.to_string(), "warming up");
    }
}
