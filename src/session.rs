//! The boundary to the inference engine.
//!
//! [`ModelSession`] owns a loaded [`InferenceBackend`] and serializes every forward pass
//! behind a mutex: a single session is never entered by two `infer` calls at once. ONNX
//! Runtime needs exclusive access to run a session, so this holds for every backend, and
//! callers that share a `Sam` across threads queue up at this lock.
//!
//! Engine outputs are handed out as [`RawTensor`] views that borrow the engine's buffers. They
//! cannot outlive the `infer` call; anything that must survive it is copied out by the
//! extraction closure.

use std::fmt;
use std::path::{Path, PathBuf};

use ndarray::prelude::*;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::SessionBuilder, Session},
    value::{DynValue, TensorRef},
};
use parking_lot::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::{Engine, SamConfig};
use crate::errors::{Result, SamError};
use crate::progress::{LoadProgress, LoadStage};
use crate::tensor::Tensor;

/// An engine-owned output tensor, valid only inside the `infer` call that produced it.
#[derive(Debug, Clone)]
pub enum RawTensor<'a> {
    F32(ArrayViewD<'a, f32>),
    Bool(ArrayViewD<'a, bool>),
}

impl RawTensor<'_> {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(view) => view.shape(),
            Self::Bool(view) => view.shape(),
        }
    }

    pub const fn dtype(&self) -> &'static str {
        match self {
            Self::F32(_) => "f32",
            Self::Bool(_) => "bool",
        }
    }
}

/// Output names of an exported SAM decoder, in the order `infer` hands them out.
pub const SAM_OUTPUT_NAMES: [&str; 3] = ["iou_predictions", "low_res_logits", "masks"];

/// Callback receiving the raw outputs of one forward pass.
pub type OutputSink<'s> = dyn FnMut(&[RawTensor<'_>]) -> Result<()> + 's;

/// A loaded model that can run forward passes.
pub trait InferenceBackend: Send {
    /// Run one forward pass on a CHW tensor and pass the outputs, in the model's declared
    /// order, to `sink` exactly once.
    fn forward(&mut self, input: ArrayViewD<'_, f32>, sink: &mut OutputSink<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Disposed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

struct SessionInner<B> {
    state: SessionState,
    backend: Option<B>,
}

pub struct ModelSession<B> {
    inner: Mutex<SessionInner<B>>,
}

impl<B: InferenceBackend> ModelSession<B> {
    /// Wrap an already loaded backend.
    pub fn new(backend: B) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Ready,
                backend: Some(backend),
            }),
        }
    }

    /// Run `loader` and move the session to `Ready`. A failed load is final: no session is
    /// returned and nothing is retried.
    pub fn load<F>(loader: F) -> Result<Self>
    where
        F: FnOnce() -> Result<B>,
    {
        let session = Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Unloaded,
                backend: None,
            }),
        };
        {
            let mut inner = session.inner.lock();
            inner.state = SessionState::Loading;
            debug!(state = %inner.state, "model session loading");
            inner.backend = Some(loader()?);
            inner.state = SessionState::Ready;
        }
        info!("model session ready");
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Run one forward pass and let `extract` turn the engine's outputs into owned values.
    ///
    /// Blocks until the engine returns. Concurrent callers are serialized.
    pub fn infer<T, F>(&self, input: &Tensor<f32>, extract: F) -> Result<T>
    where
        F: FnOnce(&[RawTensor<'_>]) -> Result<T>,
    {
        let view = input.view()?;
        let mut inner = self.inner.lock();
        let state = inner.state;
        let backend = match inner.backend.as_mut() {
            Some(backend) if state == SessionState::Ready => backend,
            _ => {
                return Err(SamError::InvalidState {
                    operation: "infer".to_string(),
                    reason: format!("on a {state} session"),
                })
            }
        };

        let mut extract = Some(extract);
        let mut extracted = None;
        backend.forward(view, &mut |raw: &[RawTensor<'_>]| {
            let extract = extract
                .take()
                .ok_or_else(|| SamError::malformed("engine delivered outputs more than once"))?;
            extracted = Some(extract(raw)?);
            Ok(())
        })?;

        extracted.ok_or_else(|| SamError::malformed("engine delivered no outputs"))
    }

    /// Release the backend. Later `infer` calls fail with `InvalidState`; disposing again does
    /// nothing.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Disposed {
            return;
        }
        inner.backend = None;
        inner.state = SessionState::Disposed;
        info!("model session disposed");
    }
}

/// ONNX Runtime backend.
pub struct OrtBackend {
    session: Session,
    input_name: String,
    input_rank: usize,
    output_names: Vec<String>,
}

impl OrtBackend {
    pub fn load(config: &SamConfig, progress: &dyn LoadProgress) -> Result<Self> {
        progress.begin(LoadStage::ResolveArtifact);
        let model_path = resolve_artifact(&config.model_path)?;
        progress.finish(LoadStage::ResolveArtifact);

        progress.begin(LoadStage::BuildSession);
        let session = build_session(config, &model_path)?;
        let input = session
            .inputs
            .first()
            .ok_or_else(|| SamError::model_load(&model_path, "model declares no inputs", None))?;
        let input_rank = input
            .input_type
            .tensor_shape()
            .map(|shape| shape.len())
            .ok_or_else(|| SamError::model_load(&model_path, "model input is not a tensor", None))?;
        let input_name = input.name.clone();
        let declared: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let output_names = ordered_output_names(&declared, &model_path)?;
        progress.finish(LoadStage::BuildSession);

        let mut backend = Self {
            session,
            input_name,
            input_rank,
            output_names,
        };
        info!(
            path = %model_path.display(),
            engine = ?config.engine,
            input = %backend.input_name,
            outputs = ?backend.output_names,
            "model loaded"
        );

        if config.warm_up {
            progress.begin(LoadStage::WarmUp);
            let size = config.image_size as usize;
            let data = ArrayD::<f32>::zeros(IxDyn(&[3, size, size]));
            backend
                .forward(data.view(), &mut |_: &[RawTensor<'_>]| Ok(()))
                .map_err(|e| SamError::ModelLoad {
                    path: model_path.clone(),
                    reason: "warm-up inference failed".to_string(),
                    source: Some(Box::new(e)),
                })?;
            progress.finish(LoadStage::WarmUp);
        }

        Ok(backend)
    }

    /// Output names in the order `forward` emits them.
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

impl InferenceBackend for OrtBackend {
    fn forward(&mut self, input: ArrayViewD<'_, f32>, sink: &mut OutputSink<'_>) -> Result<()> {
        let input = batched(input, self.input_rank);
        let input = input.as_standard_layout();
        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| SamError::inference("input tensor conversion", e))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| SamError::inference("forward pass", e))?;

        let raw = self
            .output_names
            .iter()
            .map(|name| raw_tensor(&outputs[name.as_str()], name))
            .collect::<Result<Vec<_>>>()?;
        sink(&raw)
    }
}

/// Add the leading batch axis a rank-4 model input expects.
fn batched(input: ArrayViewD<'_, f32>, input_rank: usize) -> ArrayViewD<'_, f32> {
    if input_rank == input.ndim() + 1 {
        input.insert_axis(Axis(0))
    } else {
        input
    }
}

/// Map the declared outputs onto `[iou_pred, low_res_logits, mask]` by name.
fn ordered_output_names(declared: &[String], model_path: &Path) -> Result<Vec<String>> {
    SAM_OUTPUT_NAMES
        .iter()
        .map(|wanted| {
            declared
                .iter()
                .find(|name| name == wanted)
                .cloned()
                .ok_or_else(|| {
                    SamError::model_load(
                        model_path,
                        format!("model has no `{wanted}` output, declared {declared:?}"),
                        None,
                    )
                })
        })
        .collect()
}

fn raw_tensor<'a>(value: &'a DynValue, name: &str) -> Result<RawTensor<'a>> {
    if let Ok(view) = value.try_extract_array::<f32>() {
        return Ok(RawTensor::F32(view));
    }
    value
        .try_extract_array::<bool>()
        .map(RawTensor::Bool)
        .map_err(|_| SamError::malformed(format!("output `{name}` is neither an f32 nor a bool tensor")))
}

fn build_session(config: &SamConfig, model_path: &Path) -> Result<Session> {
    let load_error = |reason: &str| {
        let reason = reason.to_string();
        move |e: ort::Error| SamError::model_load(model_path, reason, Some(e))
    };

    let mut builder = SessionBuilder::new()
        .map_err(load_error("session builder initialisation"))?
        .with_execution_providers(execution_providers(config.engine, config.device_id))
        .map_err(load_error("execution provider registration"))?
        .with_memory_pattern(true)
        .map_err(load_error("memory pattern configuration"))?;
    if let Some(threads) = config.intra_threads {
        builder = builder
            .with_intra_threads(threads)
            .map_err(load_error("thread pool configuration"))?;
    }
    builder
        .commit_from_file(model_path)
        .map_err(load_error("model parsing"))
}

fn execution_providers(engine: Engine, device_id: i32) -> Vec<ExecutionProviderDispatch> {
    let cpu = CPUExecutionProvider::default().build();
    let cuda = || {
        CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
    };
    match engine {
        Engine::Cpu => vec![cpu],
        Engine::Cuda => vec![cuda(), cpu],
        Engine::TensorRt => vec![
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            cuda(),
            cpu,
        ],
    }
}

/// Find the model file for `path`.
///
/// A file is used as is. For a directory, `<dir>/<dir name>.onnx` wins, otherwise the
/// directory must contain exactly one `.onnx` file.
pub fn resolve_artifact(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        return Err(SamError::model_load(path, "model artifact does not exist", None));
    }

    if let Some(name) = path.file_name() {
        let named = path.join(format!("{}.onnx", name.to_string_lossy()));
        if named.is_file() {
            return Ok(named);
        }
    }

    let candidates: Vec<PathBuf> = WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "onnx"))
        .collect();

    match <[PathBuf; 1]>::try_from(candidates) {
        Ok([model]) => Ok(model),
        Err(candidates) => Err(SamError::model_load(
            path,
            format!(
                "expected one .onnx model in the directory, found {}",
                candidates.len()
            ),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockBackend;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_artifact_prefers_directory_named_model() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let model_dir = temp_dir.path().join("sam_vit_b");
        fs::create_dir_all(&model_dir)?;
        fs::write(model_dir.join("sam_vit_b.onnx"), b"")?;
        fs::write(model_dir.join("other.onnx"), b"")?;

        assert_eq!(resolve_artifact(&model_dir)?, model_dir.join("sam_vit_b.onnx"));
        Ok(())
    }

    #[test]
    fn test_resolve_artifact_single_candidate_and_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let model = temp_dir.path().join("encoder.onnx");
        fs::write(&model, b"")?;
        fs::write(temp_dir.path().join("README.txt"), b"")?;

        assert_eq!(resolve_artifact(temp_dir.path())?, model);
        assert_eq!(resolve_artifact(&model)?, model);
        Ok(())
    }

    #[test]
    fn test_resolve_artifact_failures() -> Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(matches!(
            resolve_artifact(&temp_dir.path().join("missing")),
            Err(SamError::ModelLoad { .. })
        ));
        assert!(matches!(
            resolve_artifact(temp_dir.path()),
            Err(SamError::ModelLoad { .. })
        ));
        fs::write(temp_dir.path().join("a.onnx"), b"")?;
        fs::write(temp_dir.path().join("b.onnx"), b"")?;
        assert!(matches!(
            resolve_artifact(temp_dir.path()),
            Err(SamError::ModelLoad { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_corrupt_model_fails_to_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let model = temp_dir.path().join("broken.onnx");
        fs::write(&model, b"definitely not protobuf")?;
        let config = SamConfig::new(&model).with_warm_up(false);

        let result = ModelSession::load(|| OrtBackend::load(&config, &crate::NoProgress));
        assert!(matches!(result, Err(SamError::ModelLoad { .. })));
        Ok(())
    }

    #[test]
    fn test_lifecycle_and_idempotent_dispose() -> Result<()> {
        let session = ModelSession::load(|| Ok(MockBackend::new()))?;
        assert_eq!(session.state(), SessionState::Ready);

        let input = Tensor::new(ArrayD::<f32>::zeros(IxDyn(&[3, 4, 4])));
        let count = session.infer(&input, |raw| Ok(raw.len()))?;
        assert_eq!(count, 3);

        session.dispose();
        session.dispose();
        assert_eq!(session.state(), SessionState::Disposed);
        assert!(matches!(
            session.infer(&input, |raw| Ok(raw.len())),
            Err(SamError::InvalidState { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_failed_load_is_surfaced() {
        let result = ModelSession::<MockBackend>::load(|| {
            Err(SamError::model_load("missing.onnx", "model artifact does not exist", None))
        });
        assert!(matches!(result, Err(SamError::ModelLoad { .. })));
    }

    #[test]
    fn test_released_input_is_rejected() -> Result<()> {
        let session = ModelSession::new(MockBackend::new());
        let mut input = Tensor::new(ArrayD::<f32>::zeros(IxDyn(&[3, 4, 4])));
        input.release();
        assert!(matches!(
            session.infer(&input, |raw| Ok(raw.len())),
            Err(SamError::InvalidState { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_outputs_are_ordered_by_name() -> Result<()> {
        let declared = ["masks", "iou_predictions", "low_res_logits"].map(String::from);
        let ordered = ordered_output_names(&declared, Path::new("sam.onnx"))?;
        assert_eq!(ordered, SAM_OUTPUT_NAMES.map(String::from));

        let incomplete = ["masks", "scores", "low_res_logits"].map(String::from);
        assert!(matches!(
            ordered_output_names(&incomplete, Path::new("sam.onnx")),
            Err(SamError::ModelLoad { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_batch_axis_follows_model_rank() {
        let data = ArrayD::<f32>::zeros(IxDyn(&[3, 8, 6]));
        assert_eq!(batched(data.view(), 4).shape(), &[1, 3, 8, 6]);
        assert_eq!(batched(data.view(), 3).shape(), &[3, 8, 6]);
    }

    #[test]
    fn test_raw_tensor_dtype_dispatch() -> Result<()> {
        let to_dyn = |e: ort::Error| SamError::inference("test tensor", e);

        let logits = ort::value::Tensor::from_array(Array::from_elem((1, 2, 2), -1.0f32))
            .map_err(to_dyn)?
            .into_dyn();
        let raw = raw_tensor(&logits, "low_res_logits")?;
        assert_eq!(raw.dtype(), "f32");
        assert_eq!(raw.shape(), &[1, 2, 2]);

        let masks = ort::value::Tensor::from_array(Array::from_elem((1, 3, 3), true))
            .map_err(to_dyn)?
            .into_dyn();
        let raw = raw_tensor(&masks, "masks")?;
        assert_eq!(raw.dtype(), "bool");
        assert_eq!(raw.shape(), &[1, 3, 3]);

        let labels = ort::value::Tensor::from_array(Array::from_elem((2,), 7i64))
            .map_err(to_dyn)?
            .into_dyn();
        assert!(matches!(
            raw_tensor(&labels, "labels"),
            Err(SamError::MalformedOutput { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_raw_tensor_metadata() {
        let data = vec![0.5f32; 6];
        let raw = RawTensor::F32(ArrayViewD::from_shape(IxDyn(&[2, 3]), &data).unwrap());
        assert_eq!(raw.shape(), &[2, 3]);
        assert_eq!(raw.dtype(), "f32");
    }
}
