//! Error taxonomy for the upscale pipeline.
//!
//! Every failure aborts the whole pipeline invocation; nothing here is
//! retried or logged-and-swallowed inside the core.

use thiserror::Error;

/// Coarse classification of an [`UpscaleError`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Decode,
    InvalidParameter,
    Shape,
    Inference,
    ModelLoad,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode => write!(f, "decode"),
            Self::InvalidParameter => write!(f, "invalid-parameter"),
            Self::Shape => write!(f, "shape"),
            Self::Inference => write!(f, "inference"),
            Self::ModelLoad => write!(f, "model-load"),
        }
    }
}

#[derive(Error, Debug)]
pub enum UpscaleError {
    /// The source image could not be decoded or rendered.
    #[error("failed to decode source image: {reason}")]
    Decode { reason: String },

    /// A size, overlap or factor was rejected before processing started.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A tensor did not match the `[1, 3, H, W]` contract.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    /// The inference engine failed while processing a tile.
    #[error("inference failed on tile {tile}: {source}")]
    Inference {
        tile: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A model handle could not be opened.
    #[error("failed to open model {model}: {source}")]
    ModelLoad {
        model: String,
        #[source]
        source: anyhow::Error,
    },
}

impl UpscaleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode { .. } => ErrorKind::Decode,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::Shape { .. } => ErrorKind::Shape,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::ModelLoad { .. } => ErrorKind::ModelLoad,
        }
    }

    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn shape(expected: &[usize], actual: &[usize]) -> Self {
        Self::Shape {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpscaleError>;
