//! ONNX Runtime realization of the learned pieces: session construction with
//! the TensorRT → CUDA → CPU fallback chain, the feature encoder, the
//! refinement stages and the accelerated splatting kernel.
//!
//! Model directory layout:
//! - `encode.onnx`: `image` [1,3,H,W] → `features` [1,F,H,W]
//! - `block{i}.onnx`: `x` [1,Cin,h,w] → `tmp` [1,5+K,h,w] (4 flow, 1 mask logit, K features)

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayD, ArrayView3, Axis, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use tracing::{debug, error, info, warn};

use crate::error::InterpolationError;
use crate::network::{
    Capabilities, FeatureEncoder, IfNet, RefinementStage, StageInput, StageOutput,
};
use crate::sampling::{rescale_by, resize_bilinear};

pub const ENCODER_FILE: &str = "encode.onnx";
const ENCODER_INPUT: &str = "image";
const ENCODER_OUTPUT: &str = "features";
const STAGE_INPUT: &str = "x";
const STAGE_OUTPUT: &str = "tmp";
const SPLAT_INPUT_VALUES: &str = "values";
const SPLAT_INPUT_FLOW: &str = "flow";
const SPLAT_OUTPUT: &str = "accumulated";

pub fn stage_file(index: usize) -> String {
    format!("block{index}.onnx")
}

/// Inference backend selection.
///
/// Default is `Cuda`. `Tensorrt` needs the TensorRT runtime libraries; without
/// them the session falls back to the CUDA EP, and without CUDA to the CPU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

type SharedSession = Arc<Mutex<Session>>;

fn count_cache_files(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| entries.flatten().filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}

/// Build an `ort::Session` with the requested backend and fallback chain.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

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

            let before = count_cache_files(cache_dir);
            let started = Instant::now();
            info!(
                model = %config.model_path.display(),
                cache_dir = %cache_dir.display(),
                cache_files = before,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                });

            let elapsed_secs = started.elapsed().as_secs_f64();
            match session_result {
                Ok(session) => {
                    info!(
                        elapsed_secs,
                        cache_files_before = before,
                        cache_files_after = count_cache_files(cache_dir),
                        "TensorRT session ready"
                    );
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs,
                        error = %error_value,
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(
                backend = "cuda",
                model = %config.model_path.display(),
                "Building session with CUDA EP"
            );

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
    };

    Ok(session)
}

fn load_shared(config: &SessionConfig<'_>) -> Result<SharedSession> {
    Ok(Arc::new(Mutex::new(build_session(config)?)))
}

/// Run a single-input, single-output session on a batch-of-one tensor.
fn run_single(
    session: &SharedSession,
    input_name: &str,
    input: &Array4<f32>,
    output_name: &str,
) -> Result<Array4<f32>> {
    let tensor = TensorRef::from_array_view(input.view())?;
    let mut session = session
        .lock()
        .map_err(|_| anyhow!("ONNX session mutex poisoned"))?;
    let outputs = session.run(ort::inputs![input_name => tensor])?;
    let output: ArrayD<f32> = outputs[output_name].try_extract_array::<f32>()?.to_owned();
    into_batch_of_one(output, output_name)
}

fn into_batch_of_one(output: ArrayD<f32>, name: &str) -> Result<Array4<f32>> {
    let output = output
        .into_dimensionality::<Ix4>()
        .map_err(|e| InterpolationError::Inference(format!("{name}: {e}")))?;
    if output.dim().0 != 1 {
        return Err(InterpolationError::Inference(format!(
            "{name}: expected batch size 1, got {}",
            output.dim().0
        ))
        .into());
    }
    Ok(output)
}

fn batched(array: Array3<f32>) -> Array4<f32> {
    array.insert_axis(Axis(0))
}

fn unbatched(array: Array4<f32>) -> Array3<f32> {
    array.index_axis_move(Axis(0), 0)
}

pub struct OnnxEncoder {
    session: SharedSession,
}

impl OnnxEncoder {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        Ok(Self {
            session: load_shared(config)?,
        })
    }
}

impl FeatureEncoder for OnnxEncoder {
    fn encode(&self, image: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let input = batched(image.as_standard_layout().into_owned());
        let output = run_single(&self.session, ENCODER_INPUT, &input, ENCODER_OUTPUT)?;
        Ok(unbatched(output))
    }
}

/// One refinement level. The session itself runs at reduced resolution; this
/// wrapper owns the resampling around it.
pub struct OnnxStage {
    session: SharedSession,
    index: usize,
}

impl OnnxStage {
    pub fn load(config: &SessionConfig<'_>, index: usize) -> Result<Self> {
        Ok(Self {
            session: load_shared(config)?,
            index,
        })
    }
}

impl RefinementStage for OnnxStage {
    fn refine(&self, input: &StageInput<'_>, scale: f32) -> Result<StageOutput> {
        let (_, h, w) = input.image0.dim();
        let timestep = input.timestep.insert_axis(Axis(0));

        let mut parts = vec![
            input.image0,
            input.image1,
            input.features0,
            input.features1,
            timestep,
        ];
        if let Some(prior) = &input.prior {
            parts.push(prior.mask.insert_axis(Axis(0)));
            parts.push(prior.features);
        }
        let stacked = concatenate(Axis(0), &parts)?;
        let mut x = rescale_by(stacked.view(), scale);

        if let Some(prior) = &input.prior {
            let (_, sh, sw) = x.dim();
            let flow = resize_bilinear(prior.flow, sh, sw) * (1.0 / scale);
            x = concatenate(Axis(0), &[x.view(), flow.view()])?;
        }

        let output = run_single(&self.session, STAGE_INPUT, &batched(x), STAGE_OUTPUT)?;
        let tmp = resize_bilinear(unbatched(output).view(), h, w);
        if tmp.dim().0 < 5 {
            return Err(InterpolationError::Inference(format!(
                "block{} produced {} channels, expected at least 5",
                self.index,
                tmp.dim().0
            ))
            .into());
        }

        Ok(StageOutput {
            flow: tmp.slice(s![0..4, .., ..]).to_owned() * scale,
            mask: tmp.slice(s![4, .., ..]).to_owned(),
            features: tmp.slice(s![5.., .., ..]).to_owned(),
        })
    }
}

/// Accelerated forward-warp kernel: returns the weighted sums followed by the
/// accumulated weight channel.
#[derive(Clone)]
pub struct OnnxSplatKernel {
    session: SharedSession,
}

impl OnnxSplatKernel {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        Ok(Self {
            session: load_shared(config)?,
        })
    }

    pub fn accumulate(
        &self,
        values: ArrayView3<'_, f32>,
        flow: ArrayView3<'_, f32>,
    ) -> Result<(Array3<f32>, Array2<f32>)> {
        let channels = values.dim().0;
        let values = batched(values.as_standard_layout().into_owned());
        let flow = batched(flow.as_standard_layout().into_owned());

        let output = {
            let values_tensor = TensorRef::from_array_view(values.view())?;
            let flow_tensor = TensorRef::from_array_view(flow.view())?;
            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow!("ONNX session mutex poisoned"))?;
            let outputs = session.run(ort::inputs![
                SPLAT_INPUT_VALUES => values_tensor,
                SPLAT_INPUT_FLOW => flow_tensor
            ])?;
            let accumulated: ArrayD<f32> =
                outputs[SPLAT_OUTPUT].try_extract_array::<f32>()?.to_owned();
            accumulated
        };

        let accumulated = unbatched(into_batch_of_one(output, SPLAT_OUTPUT)?);
        if accumulated.dim().0 != channels + 1 {
            return Err(InterpolationError::Inference(format!(
                "splat kernel returned {} channels, expected {}",
                accumulated.dim().0,
                channels + 1
            ))
            .into());
        }

        let sums = accumulated.slice(s![0..channels, .., ..]).to_owned();
        let weights = accumulated.slice(s![channels, .., ..]).to_owned();
        Ok((sums, weights))
    }
}

/// Paths of every session file a network with `levels` stages needs.
pub fn network_files(model_dir: &Path, levels: usize) -> Vec<PathBuf> {
    std::iter::once(model_dir.join(ENCODER_FILE))
        .chain((0..levels).map(|i| model_dir.join(stage_file(i))))
        .collect()
}

/// Load the encoder and one stage per pyramid level from `model_dir`.
pub fn load_network(
    model_dir: &Path,
    backend: &InferenceBackend,
    trt_cache_dir: Option<&Path>,
    scale_factors: Vec<f32>,
    capabilities: Capabilities,
) -> Result<IfNet> {
    let files = network_files(model_dir, scale_factors.len());
    if let Some(missing) = files.iter().find(|path| !path.exists()) {
        return Err(anyhow!("model file not found: {}", missing.display()));
    }

    let encoder = OnnxEncoder::load(&SessionConfig {
        model_path: &files[0],
        backend,
        trt_cache_dir,
    })?;

    let mut stages: Vec<Box<dyn RefinementStage>> = Vec::with_capacity(files.len() - 1);
    for (index, path) in files[1..].iter().enumerate() {
        let config = SessionConfig {
            model_path: path,
            backend,
            trt_cache_dir,
        };
        stages.push(Box::new(OnnxStage::load(&config, index)?));
    }

    info!(
        model_dir = %model_dir.display(),
        backend = %backend,
        levels = stages.len(),
        "Loaded DRBA flow network"
    );

    Ok(IfNet::new(Box::new(encoder), stages, scale_factors)?.with_capabilities(capabilities))
}
