//! Per-tile inference dispatch.
//!
//! A tile goes pixels → tensor → [`InferenceEngine::run`] → tensor → pixels.
//! Engine failures surface as [`UpscaleError::Inference`] without retry.

use tracing::trace;

use crate::error::{Result, UpscaleError};
use crate::pixels::{pixels_to_tensor, tensor_to_pixels};
use crate::types::{ImageTensor, PixelBuffer, TensorLayout, Tile, RGB_CHANNELS};

/// Injected inference capability: one normalized tensor in, one out.
///
/// Implementations may block while the model runs; the pipeline calls
/// `run` for one tile at a time and never concurrently.
pub trait InferenceEngine {
    fn run(&mut self, input: ImageTensor) -> anyhow::Result<ImageTensor>;

    /// Human-readable identifier for logs.
    fn name(&self) -> &str {
        "inference-engine"
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for &mut E {
    fn run(&mut self, input: ImageTensor) -> anyhow::Result<ImageTensor> {
        (**self).run(input)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn run(&mut self, input: ImageTensor) -> anyhow::Result<ImageTensor> {
        (**self).run(input)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Adapts a closure into an [`InferenceEngine`].
pub struct FnEngine<F> {
    name: String,
    f: F,
}

impl<F> FnEngine<F>
where
    F: FnMut(ImageTensor) -> anyhow::Result<ImageTensor>,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> InferenceEngine for FnEngine<F>
where
    F: FnMut(ImageTensor) -> anyhow::Result<ImageTensor>,
{
    fn run(&mut self, input: ImageTensor) -> anyhow::Result<ImageTensor> {
        (self.f)(input)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Geometry and encoding every tile shares for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub tile_width: u32,
    pub tile_height: u32,
    pub upscale_factor: u32,
    pub layout: TensorLayout,
}

impl TileSpec {
    /// Shape the engine must return for one tile.
    pub fn expected_output_shape(&self) -> [usize; 4] {
        [
            1,
            RGB_CHANNELS,
            self.tile_height as usize * self.upscale_factor as usize,
            self.tile_width as usize * self.upscale_factor as usize,
        ]
    }
}

/// Run one tile through the engine and return the upscaled pixels.
///
/// `index` is the tile's position in grid order and is only used for error
/// reporting.
pub fn process_tile<E: InferenceEngine + ?Sized>(
    tile: &Tile,
    index: usize,
    engine: &mut E,
    geometry: &TileSpec,
) -> Result<PixelBuffer> {
    if tile.pixels.width() != geometry.tile_width || tile.pixels.height() != geometry.tile_height {
        return Err(UpscaleError::invalid(
            "tile",
            format!(
                "tile {index} is {}x{}, model input is {}x{}",
                tile.pixels.width(),
                tile.pixels.height(),
                geometry.tile_width,
                geometry.tile_height
            ),
        ));
    }

    let input = pixels_to_tensor(&tile.pixels, geometry.layout);
    trace!(index, x = tile.x, y = tile.y, shape = ?input.shape(), "Dispatching tile");

    let output = engine
        .run(input)
        .map_err(|source| UpscaleError::Inference { tile: index, source })?;

    let expected = geometry.expected_output_shape();
    if output.shape() != expected {
        return Err(UpscaleError::shape(&expected, &output.shape()));
    }
    if output.layout() != geometry.layout {
        return Err(UpscaleError::Shape {
            expected: format!("{} layout", geometry.layout),
            actual: format!("{} layout", output.layout()),
        });
    }

    tensor_to_pixels(&output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn geometry(factor: u32) -> TileSpec {
        TileSpec {
            tile_width: 4,
            tile_height: 2,
            upscale_factor: factor,
            layout: TensorLayout::Planar,
        }
    }

    fn solid_tile(rgb: [u8; 3]) -> Tile {
        let mut data = Vec::new();
        for _ in 0..4 * 2 {
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        Tile {
            pixels: PixelBuffer::new(4, 2, data).unwrap(),
            x: 0,
            y: 0,
        }
    }

    /// Nearest-neighbour upscale in tensor space.
    fn nearest(factor: usize) -> impl FnMut(ImageTensor) -> anyhow::Result<ImageTensor> {
        move |input: ImageTensor| {
            let [_, _, h, w] = input.shape();
            let (oh, ow) = (h * factor, w * factor);
            let mut out = vec![0.0f32; 3 * oh * ow];
            for c in 0..3 {
                for y in 0..oh {
                    for x in 0..ow {
                        out[c * oh * ow + y * ow + x] =
                            input.data()[c * h * w + (y / factor) * w + x / factor];
                    }
                }
            }
            Ok(ImageTensor::new(out, [1, 3, oh, ow], input.layout())?)
        }
    }

    #[test]
    fn test_process_tile_upscales() {
        let mut engine = FnEngine::new("nearest", nearest(2));
        let out = process_tile(&solid_tile([10, 20, 30]), 0, &mut engine, &geometry(2)).unwrap();
        assert_eq!((out.width(), out.height()), (8, 4));
        assert_eq!(out.pixel(7, 3), Some([10, 20, 30, 255]));
    }

    #[test]
    fn test_process_tile_wrong_output_shape() {
        let mut engine = FnEngine::new("identity", |t: ImageTensor| Ok(t));
        let err = process_tile(&solid_tile([0, 0, 0]), 5, &mut engine, &geometry(4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
        assert!(err.to_string().contains("[1, 3, 8, 16]"));
    }

    #[test]
    fn test_process_tile_engine_failure() {
        let mut engine = FnEngine::new("broken", |_t: ImageTensor| -> anyhow::Result<ImageTensor> {
            anyhow::bail!("device lost")
        });
        let err = process_tile(&solid_tile([0, 0, 0]), 7, &mut engine, &geometry(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);
        match err {
            UpscaleError::Inference { tile, source } => {
                assert_eq!(tile, 7);
                assert_eq!(source.to_string(), "device lost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_process_tile_layout_mismatch() {
        let mut engine = FnEngine::new("relabel", |t: ImageTensor| {
            let shape = t.shape();
            Ok(ImageTensor::new(t.into_data(), shape, TensorLayout::Interleaved)?)
        });
        let err = process_tile(&solid_tile([1, 2, 3]), 0, &mut engine, &geometry(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_process_tile_rejects_wrong_tile_size() {
        let mut calls = 0;
        let mut engine = FnEngine::new("count", |t: ImageTensor| {
            calls += 1;
            Ok(t)
        });
        let tile = Tile {
            pixels: PixelBuffer::new(3, 3, vec![0; 36]).unwrap(),
            x: 0,
            y: 0,
        };
        let err = process_tile(&tile, 0, &mut engine, &geometry(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        drop(engine);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_engine_name_through_references() {
        let mut engine = FnEngine::new("named", |t: ImageTensor| Ok(t));
        assert_eq!(InferenceEngine::name(&&mut engine), "named");
        let boxed: Box<dyn InferenceEngine> = Box::new(engine);
        assert_eq!(boxed.name(), "named");
    }
}
