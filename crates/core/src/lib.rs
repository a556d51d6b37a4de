//! Core crate for DRBA triplet frame interpolation.

pub mod config;
pub mod drm;
pub mod error;
pub mod interpolator;
pub mod logging;
pub mod network;
pub mod onnx;
pub mod sampling;
pub mod scene;
pub mod scheduler;
pub mod splat;
pub mod synth;
pub mod types;

pub use error::{InterpolationError, InterpolationWarning};
pub use interpolator::{Interpolator, SequenceInterpolator};
pub use scheduler::{ReuseBundle, SceneChanges, TripletOutput, TripletScheduler};
pub use types::{Frame, PairFlow, TimestampPlan, TimestepField};
