use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::InterpolationError;
use crate::network::DEFAULT_SCALE_FACTORS;
use crate::onnx::InferenceBackend;
use crate::synth::SynthesisOptions;

pub const DEFAULT_PAD_ALIGN: usize = 64;
pub const DEFAULT_SCENE_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpolatorConfig {
    pub model: ModelConfig,
    pub inference: InferenceConfig,
    pub scene: SceneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Holds `encode.onnx` and `block0.onnx` .. `block{N-1}.onnx`.
    pub dir: PathBuf,
    pub backend: String,
    pub trt_cache_dir: PathBuf,
    /// Accelerated forward-warp kernel (e.g. `softsplat.onnx`), relative to
    /// `dir`. Unset or unloadable means the portable kernel.
    pub splat_kernel: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub scale: f32,
    pub scale_factors: Vec<f32>,
    pub ensemble: bool,
    pub fast_mode: bool,
    pub pad_align: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SceneConfig {
    /// Mean-luma jump (0..1) above which two frames count as a cut.
    pub threshold: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models/drba"),
            backend: InferenceBackend::Cuda.to_string(),
            trt_cache_dir: PathBuf::from("trt_cache"),
            splat_kernel: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            scale_factors: DEFAULT_SCALE_FACTORS.to_vec(),
            ensemble: false,
            fast_mode: true,
            pad_align: DEFAULT_PAD_ALIGN,
        }
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SCENE_THRESHOLD,
        }
    }
}

impl ModelConfig {
    pub fn backend(&self) -> InferenceBackend {
        InferenceBackend::from_str_lossy(&self.backend)
    }

    pub fn splat_kernel_path(&self) -> Option<PathBuf> {
        self.splat_kernel
            .as_deref()
            .map(|kernel| resolve_relative_to(&self.dir, kernel))
    }
}

impl InferenceConfig {
    pub fn synthesis_options(&self) -> SynthesisOptions {
        SynthesisOptions {
            scale: self.scale,
            ensemble: self.ensemble,
            fast_mode: self.fast_mode,
        }
    }
}

impl InterpolatorConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Anchor relative model paths at `base` (usually the config file's directory).
    pub fn resolve_relative_to(mut self, base: &Path) -> Self {
        self.model.dir = resolve_relative_to(base, &self.model.dir);
        self.model.trt_cache_dir = resolve_relative_to(base, &self.model.trt_cache_dir);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let inference = &self.inference;
        if !(inference.scale.is_finite() && inference.scale > 0.0) {
            return Err(invalid(format!("inference.scale {} must be > 0", inference.scale)));
        }
        if inference.scale_factors.is_empty() {
            return Err(invalid("inference.scale_factors must not be empty".to_string()));
        }
        if let Some(bad) = inference
            .scale_factors
            .iter()
            .find(|f| !(f.is_finite() && **f > 0.0))
        {
            return Err(invalid(format!("inference.scale_factors entry {bad} must be > 0")));
        }
        if inference.pad_align == 0 {
            return Err(invalid("inference.pad_align must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.scene.threshold) {
            return Err(invalid(format!(
                "scene.threshold {} must be within [0, 1]",
                self.scene.threshold
            )));
        }
        Ok(())
    }
}

fn invalid(message: String) -> anyhow::Error {
    InterpolationError::InvalidConfig(message).into()
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
