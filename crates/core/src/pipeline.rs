//! Pipeline orchestrator: decode → split → dispatch → composite.
//!
//! Tiles are processed strictly one at a time in grid order. The output
//! canvas is private to a run and only handed back once every tile has been
//! composited; any failure drops it and returns the error.

use std::time::Instant;

use tracing::{debug, info};

use crate::compositor::{composite_tile, OutputCanvas};
use crate::config::UpscaleConfig;
use crate::dispatch::{process_tile, InferenceEngine};
use crate::error::{ErrorKind, Result, UpscaleError};
use crate::model_registry::{ModelLoader, ModelRegistry};
use crate::pixels::decode_native;
use crate::tiling::split_into_tiles;
use crate::types::{PixelBuffer, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Loading,
    Splitting,
    Dispatching { tile: usize, total: usize },
    Compositing { tile: usize, total: usize },
    Done,
    Failed(ErrorKind),
}

/// Reported after each tile has been written to the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileProgress {
    pub completed: usize,
    pub total: usize,
    pub x: u32,
    pub y: u32,
}

impl TileProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f32 / self.total as f32).clamp(0.0, 1.0)
    }
}

pub type ProgressCallback = Box<dyn FnMut(TileProgress) + Send>;

pub struct UpscalePipeline {
    config: UpscaleConfig,
    state: PipelineState,
    progress: Option<ProgressCallback>,
}

impl UpscalePipeline {
    /// Validates `config` before anything else happens.
    pub fn new(config: UpscaleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: PipelineState::Idle,
            progress: None,
        })
    }

    pub fn with_progress(mut self, callback: impl FnMut(TileProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &UpscaleConfig {
        &self.config
    }

    /// Upscale `source` with `engine`, returning a `(W*f) x (H*f)` buffer.
    pub fn run<E: InferenceEngine + ?Sized>(
        &mut self,
        source: &SourceKind,
        engine: &mut E,
    ) -> Result<PixelBuffer> {
        match self.run_stages(source, engine) {
            Ok(pixels) => {
                self.state = PipelineState::Done;
                Ok(pixels)
            }
            Err(error) => {
                self.state = PipelineState::Failed(error.kind());
                Err(error)
            }
        }
    }

    fn run_stages<E: InferenceEngine + ?Sized>(
        &mut self,
        source: &SourceKind,
        engine: &mut E,
    ) -> Result<PixelBuffer> {
        let started = Instant::now();
        let factor = self.config.upscale_factor;
        let tile_spec = self.config.tile_spec();

        self.state = PipelineState::Loading;
        let pixels = decode_native(source)?;
        let (src_w, src_h) = (pixels.width(), pixels.height());

        let out_w = src_w.checked_mul(factor);
        let out_h = src_h.checked_mul(factor);
        let (Some(out_w), Some(out_h)) = (out_w, out_h) else {
            return Err(UpscaleError::invalid(
                "upscale_factor",
                format!("{src_w}x{src_h} scaled by {factor} overflows the output size"),
            ));
        };

        self.state = PipelineState::Splitting;
        let grid = split_into_tiles(
            &pixels,
            self.config.tile_width,
            self.config.tile_height,
            self.config.overlap_px,
        )?;
        drop(pixels);

        let total = grid.len();
        info!(
            engine = engine.name(),
            src_w,
            src_h,
            out_w,
            out_h,
            tiles = total,
            columns = grid.columns,
            rows = grid.rows,
            "Starting tiled upscale"
        );

        let mut canvas = OutputCanvas::new(out_w, out_h);
        for (index, tile) in grid.iter().enumerate() {
            self.state = PipelineState::Dispatching { tile: index, total };
            let upscaled = process_tile(tile, index, engine, &tile_spec)?;

            self.state = PipelineState::Compositing { tile: index, total };
            let written = composite_tile(&mut canvas, &upscaled, tile.x, tile.y, factor);
            debug!(index, x = tile.x, y = tile.y, written, "Composited tile");

            if let Some(callback) = self.progress.as_mut() {
                callback(TileProgress {
                    completed: index + 1,
                    total,
                    x: tile.x,
                    y: tile.y,
                });
            }
        }

        info!(
            out_w,
            out_h,
            tiles = total,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Tiled upscale complete"
        );
        Ok(canvas.into_pixels())
    }
}

/// Open `model_id` through `registry` and upscale `source` with it.
///
/// `config.model_path` is the location handed to the registry's loader the
/// first time the model is opened; later calls reuse the open handle.
pub fn upscale_image<L: ModelLoader>(
    source: &SourceKind,
    model_id: &str,
    registry: &mut ModelRegistry<L>,
    config: &UpscaleConfig,
) -> Result<PixelBuffer> {
    let mut pipeline = UpscalePipeline::new(config.clone())?;
    let engine = registry.open(model_id, &config.model_path)?;
    pipeline.run(source, engine)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::dispatch::FnEngine;
    use crate::types::ImageTensor;

    fn config(tile: u32, overlap: u32, factor: u32) -> UpscaleConfig {
        UpscaleConfig {
            tile_width: tile,
            tile_height: tile,
            overlap_px: overlap,
            upscale_factor: factor,
            ..UpscaleConfig::default()
        }
    }

    fn raw_source(width: u32, height: u32) -> SourceKind {
        let data = (0..width * height * 4).map(|i| (i % 251) as u8).collect();
        SourceKind::Raw(PixelBuffer::new(width, height, data).unwrap())
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = UpscalePipeline::new(config(32, 32, 4)).err().expect("should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_identity_engine_reproduces_source() {
        let source = raw_source(10, 7);
        let mut engine = FnEngine::new("identity", |t: ImageTensor| Ok(t));
        let mut pipeline = UpscalePipeline::new(config(4, 1, 1)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let out = pipeline.run(&source, &mut engine).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Done);

        let SourceKind::Raw(src) = &source else {
            unreachable!()
        };
        assert_eq!((out.width(), out.height()), (10, 7));
        for y in 0..7 {
            for x in 0..10 {
                let [r, g, b, _] = src.pixel(x, y).unwrap();
                assert_eq!(out.pixel(x, y), Some([r, g, b, 255]));
            }
        }
    }

    #[test]
    fn test_failure_sets_failed_state() {
        let source = raw_source(8, 8);
        let mut engine = FnEngine::new("broken", |_t: ImageTensor| -> anyhow::Result<ImageTensor> {
            anyhow::bail!("out of memory")
        });
        let mut pipeline = UpscalePipeline::new(config(4, 0, 2)).unwrap();
        let err = pipeline.run(&source, &mut engine).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert_eq!(pipeline.state(), PipelineState::Failed(ErrorKind::Inference));
    }

    #[test]
    fn test_progress_reports_every_tile_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut pipeline = UpscalePipeline::new(config(4, 0, 1))
            .unwrap()
            .with_progress(move |p| sink.lock().unwrap().push(p));

        let mut engine = FnEngine::new("identity", |t: ImageTensor| Ok(t));
        pipeline.run(&raw_source(8, 6), &mut engine).unwrap();

        let seen = seen.lock().unwrap();
        let positions: Vec<(usize, u32, u32)> =
            seen.iter().map(|p| (p.completed, p.x, p.y)).collect();
        assert_eq!(
            positions,
            vec![(1, 0, 0), (2, 4, 0), (3, 0, 4), (4, 4, 4)]
        );
        assert!(seen.iter().all(|p| p.total == 4));
        assert_eq!(seen.last().unwrap().fraction(), 1.0);
    }

    #[test]
    fn test_overflowing_output_size_is_rejected() {
        let mut engine = FnEngine::new("identity", |t: ImageTensor| Ok(t));
        let mut pipeline = UpscalePipeline::new(config(4, 0, u32::MAX)).unwrap();
        let err = pipeline.run(&raw_source(4, 4), &mut engine).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }
}
