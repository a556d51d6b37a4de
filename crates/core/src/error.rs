//! Typed failures and warnings for the interpolation core.
//!
//! Functions return `anyhow::Result`; guard checks raise an [`InterpolationError`]
//! so callers can tell caller mistakes apart from runtime failures with
//! `err.downcast_ref::<InterpolationError>()`.

use std::fmt;

use thiserror::Error;

/// Which timestamp list a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampList {
    Minus,
    Zero,
    Plus,
}

impl fmt::Display for TimestampList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minus => write!(f, "minus_t"),
            Self::Zero => write!(f, "zero_t"),
            Self::Plus => write!(f, "plus_t"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpolationError {
    #[error("{list} value {value} is outside its allowed range")]
    InvalidTimestamp { list: TimestampList, value: f32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: expected {expected:?} (HxW), found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("channel mismatch: expected {expected} channels, found {found}")]
    ChannelMismatch { expected: usize, found: usize },

    #[error("network output malformed: {0}")]
    Inference(String),
}

/// Non-fatal degradations reported alongside a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationWarning {
    /// Ensemble flow estimation was requested but the network generation does
    /// not support it; flow was estimated without ensembling.
    EnsembleUnsupported,
    /// The post-processing context refinement was requested but the network
    /// does not ship it; output is the plain blended frame.
    ContextRefinementRemoved,
}

impl fmt::Display for InterpolationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnsembleUnsupported => {
                write!(f, "ensemble is not supported by this flow network; ignored")
            }
            Self::ContextRefinementRemoved => {
                write!(f, "context refinement is not part of this flow network; skipped")
            }
        }
    }
}
