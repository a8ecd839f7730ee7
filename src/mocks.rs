use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::prelude::*;

use crate::errors::{Result, SamError};
use crate::session::{InferenceBackend, OutputSink, RawTensor};

/// Call accounting shared between a [`MockBackend`] and the test that owns it.
#[derive(Debug, Default)]
pub struct MockProbe {
    calls: AtomicUsize,
    active: AtomicUsize,
    overlapped: AtomicBool,
}

impl MockProbe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether two forward passes were ever inside the backend at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

/// Test double for an inference engine.
///
/// The mask marks every pixel whose first input channel is positive, so a normalised white
/// region comes back set and a black region comes back clear. Outputs live in buffers the
/// backend reuses across calls, the way a native engine reuses its arena.
#[derive(Debug)]
pub struct MockBackend {
    iou: Vec<f32>,
    logits: Vec<f32>,
    mask: Vec<bool>,
    output_count: usize,
    delay: Duration,
    probe: Arc<MockProbe>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            iou: Vec::new(),
            logits: Vec::new(),
            mask: Vec::new(),
            output_count: 3,
            delay: Duration::ZERO,
            probe: Arc::default(),
        }
    }

    /// Emit `count` outputs instead of three.
    pub fn with_output_count(mut self, count: usize) -> Self {
        self.output_count = count;
        self
    }

    /// Sleep inside every forward pass.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<MockProbe> {
        Arc::clone(&self.probe)
    }
}

impl InferenceBackend for MockBackend {
    fn forward(&mut self, input: ArrayViewD<'_, f32>, sink: &mut OutputSink<'_>) -> Result<()> {
        let input = input
            .into_dimensionality::<Ix3>()
            .map_err(|e| SamError::InvalidImage {
                reason: format!("mock backend expects a CHW tensor: {e}"),
            })?;
        let (_, height, width) = input.dim();

        let _active = ActiveCall::enter(Arc::clone(&self.probe));
        std::thread::sleep(self.delay);

        self.mask.clear();
        self.mask
            .extend(input.index_axis(Axis(0), 0).iter().map(|&v| v > 0.0));
        let set = self.mask.iter().filter(|&&m| m).count();
        self.iou.clear();
        self.iou.push(set as f32 / self.mask.len().max(1) as f32);
        let (low_h, low_w) = ((height / 4).max(1), (width / 4).max(1));
        self.logits.clear();
        self.logits.resize(low_h * low_w, -1.0);

        let mut raw = vec![
            RawTensor::F32(ArrayViewD::from_shape(IxDyn(&[1]), &self.iou).map_err(shape_error)?),
            RawTensor::F32(
                ArrayViewD::from_shape(IxDyn(&[1, low_h, low_w]), &self.logits)
                    .map_err(shape_error)?,
            ),
            RawTensor::Bool(
                ArrayViewD::from_shape(IxDyn(&[1, height, width]), &self.mask)
                    .map_err(shape_error)?,
            ),
        ];
        raw.resize(self.output_count, raw[0].clone());

        sink(&raw)
    }
}

/// Marks a forward pass as in flight until dropped, on every exit path.
struct ActiveCall(Arc<MockProbe>);

impl ActiveCall {
    fn enter(probe: Arc<MockProbe>) -> Self {
        probe.calls.fetch_add(1, Ordering::SeqCst);
        if probe.active.fetch_add(1, Ordering::SeqCst) > 0 {
            probe.overlapped.store(true, Ordering::SeqCst);
        }
        Self(probe)
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn shape_error(err: ndarray::ShapeError) -> SamError {
    SamError::malformed(format!("mock output shape: {err}"))
}
