//! ONNX Runtime inference: execution-provider selection and the
//! [`OrtModel`] engine that runs one tile tensor per call.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::dispatch::InferenceEngine;
use crate::model_registry::ModelLoader;
use crate::types::ImageTensor;

/// Inference backend selection.
///
/// Default is `Cuda`. `Tensorrt` requires TensorRT runtime libraries (`libnvinfer.so.10` or `nvinfer.dll`)
/// to be installed; if unavailable, the session falls back to CUDA EP automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Build an `ort::Session` with the requested backend and fallback chain.
///
/// For `InferenceBackend::Tensorrt`:
///   - Registers TRT EP with engine caching, then CUDA EP as fallback.
///
/// For `InferenceBackend::Cuda`:
///   - Registers CUDA EP only; ORT falls back to CPU when it is unavailable.
///
/// `InferenceBackend::Cpu` registers nothing and uses ORT's default CPU EP.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let started = Instant::now();

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let cache_path = cache_dir.to_string_lossy().to_string();
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
    };

    info!(
        backend = %config.backend,
        model = %config.model_path.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "ONNX session ready"
    );
    Ok(session)
}

/// An opened ONNX super-resolution model.
///
/// Pipeline tensors carry values in `[0, 1]`; they are mapped to
/// `value_range` before the session runs and back afterwards. The tensor's
/// memory order is passed through untouched, so the configured layout must
/// be the one the model was exported with.
pub struct OrtModel {
    name: String,
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    value_range: (f32, f32),
}

impl OrtModel {
    pub fn open(name: &str, config: &SessionConfig<'_>, value_range: (f32, f32)) -> Result<Self> {
        debug!(
            model = %config.model_path.display(),
            backend = %config.backend,
            "Loading ONNX super-resolution model"
        );

        let session = build_session(config)?;

        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let input_name = input.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?
            .name()
            .to_string();

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            name: name.to_string(),
            session,
            input_name,
            output_name,
            is_fp16,
            value_range,
        })
    }

    fn infer(&mut self, data: Vec<f32>, shape: [usize; 4]) -> Result<ArrayD<f32>> {
        let input_name = self.input_name.as_str();
        let output_name = self.output_name.as_str();

        if self.is_fp16 {
            let mut fp16_data = vec![f16::ZERO; data.len()];
            fp16_data.convert_from_f32_slice(&data);
            let input_tensor = Tensor::from_array(Array4::from_shape_vec(shape, fp16_data)?)?;
            let outputs = self
                .session
                .run(ort::inputs![input_name => &input_tensor])?;
            let output_view = outputs[output_name].try_extract_array::<f16>()?;

            let standard = output_view.as_standard_layout();
            let fp16_slice = standard
                .as_slice()
                .context("FP16 output is not contiguous")?;
            let mut f32_data = vec![0.0f32; fp16_slice.len()];
            fp16_slice.convert_to_f32_slice(&mut f32_data);
            Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
        } else {
            let input_tensor = Tensor::from_array(Array4::from_shape_vec(shape, data)?)?;
            let outputs = self
                .session
                .run(ort::inputs![input_name => &input_tensor])?;
            let output_view = outputs[output_name].try_extract_array::<f32>()?;
            Ok(output_view.to_owned())
        }
    }
}

impl InferenceEngine for OrtModel {
    fn run(&mut self, input: ImageTensor) -> Result<ImageTensor> {
        let layout = input.layout();
        let (data, shape) = session_input(input, self.value_range);

        let output = self.infer(data, shape)?;
        let out_shape: [usize; 4] = output
            .shape()
            .try_into()
            .map_err(|_| anyhow!("expected 4-D model output, got {:?}", output.shape()))?;

        let mut values: Vec<f32> = output.iter().copied().collect();
        let (lo, hi) = self.value_range;
        unscale_values(&mut values, lo, hi);

        Ok(ImageTensor::new(values, out_shape, layout)?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens [`OrtModel`]s, resolving locations through a [`ModelCatalog`].
pub struct OrtModelLoader {
    catalog: ModelCatalog,
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
}

impl OrtModelLoader {
    pub fn new(catalog: ModelCatalog, backend: InferenceBackend, trt_cache_dir: Option<PathBuf>) -> Self {
        Self {
            catalog,
            backend,
            trt_cache_dir,
        }
    }
}

impl ModelLoader for OrtModelLoader {
    type Handle = OrtModel;

    fn load(&self, model_id: &str, location: &str) -> Result<OrtModel> {
        let model_path = self.catalog.resolve_location(location)?;
        let value_range = self
            .catalog
            .get(model_id)
            .or_else(|| self.catalog.find_by_path(&model_path))
            .map(|entry| entry.normalization_range)
            .unwrap_or((0.0, 1.0));

        let config = SessionConfig {
            model_path: &model_path,
            backend: self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        };
        OrtModel::open(model_id, &config, value_range)
    }
}

/// Buffer handed to the session: the tensor's own memory order, scaled to
/// the model's value range.
fn session_input(input: ImageTensor, (lo, hi): (f32, f32)) -> (Vec<f32>, [usize; 4]) {
    let shape = input.shape();
    let mut data = input.into_data();
    scale_values(&mut data, lo, hi);
    (data, shape)
}

/// `[0, 1]` → `[lo, hi]`
fn scale_values(data: &mut [f32], lo: f32, hi: f32) {
    let span = hi - lo;
    if lo == 0.0 && span == 1.0 {
        return;
    }
    for v in data.iter_mut() {
        *v = lo + *v * span;
    }
}

/// `[lo, hi]` → `[0, 1]`
fn unscale_values(data: &mut [f32], lo: f32, hi: f32) {
    let span = hi - lo;
    if (lo == 0.0 && span == 1.0) || span == 0.0 {
        return;
    }
    for v in data.iter_mut() {
        *v = (*v - lo) / span;
    }
}
