//! Core crate for tiled image super-resolution.
//!
//! An image is decoded, split into fixed-size overlapping tiles, each tile is
//! run through an [`dispatch::InferenceEngine`], and the upscaled tiles are
//! composited into one output buffer.

pub mod backend;
pub mod catalog;
pub mod compositor;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod model_registry;
pub mod pipeline;
pub mod pixels;
pub mod runtime;
pub mod tiling;
pub mod types;

pub use dispatch::{FnEngine, InferenceEngine};
pub use error::{ErrorKind, UpscaleError};
pub use pipeline::{upscale_image, PipelineState, TileProgress, UpscalePipeline};
pub use types::{ImageTensor, PixelBuffer, SourceKind, TensorLayout};
