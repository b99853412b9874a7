use std::path::PathBuf;

use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpscaleError};

/// Bytes per RGBA8 pixel.
pub const RGBA_CHANNELS: usize = 4;
/// Colour channels carried by an [`ImageTensor`] (alpha is dropped).
pub const RGB_CHANNELS: usize = 3;

/// Row-major RGBA8 pixel buffer, stride = width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wraps raw RGBA bytes, checking `data.len() == width * height * 4`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(UpscaleError::invalid(
                "dimensions",
                format!("pixel buffer must be non-empty, got {width}x{height}"),
            ));
        }
        let expected = width as usize * height as usize * RGBA_CHANNELS;
        if data.len() != expected {
            return Err(UpscaleError::invalid(
                "data",
                format!(
                    "expected {expected} bytes for {width}x{height} RGBA, got {}",
                    data.len()
                ),
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Zero-filled (fully transparent) buffer.
    pub(crate) fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * RGBA_CHANNELS],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// RGBA value at `(x, y)`, or `None` outside the buffer.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * RGBA_CHANNELS;
        Some([
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ])
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        // Length invariant is enforced by every constructor.
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    pub(crate) fn from_rgba_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }
}

/// Memory order of the colour planes inside an [`ImageTensor`].
///
/// Both layouts carry the shape `[1, 3, H, W]`; they are not interchangeable
/// for a given model and encode/decode must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// All red values, then all green, then all blue (NCHW).
    #[default]
    Planar,
    /// RGB triplets per pixel in scan order.
    Interleaved,
}

impl TensorLayout {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "planar" | "nchw" => Some(Self::Planar),
            "interleaved" | "hwc" => Some(Self::Interleaved),
            _ => None,
        }
    }
}

impl std::fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planar => write!(f, "planar"),
            Self::Interleaved => write!(f, "interleaved"),
        }
    }
}

/// Normalized `[1, 3, H, W]` float tensor exchanged with the inference engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    shape: [usize; 4],
    layout: TensorLayout,
}

impl ImageTensor {
    /// Checks that `data` holds exactly as many values as `shape` describes.
    pub fn new(data: Vec<f32>, shape: [usize; 4], layout: TensorLayout) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(UpscaleError::Shape {
                expected: format!("{expected} values for {shape:?}"),
                actual: format!("{} values", data.len()),
            });
        }
        Ok(Self {
            data,
            shape,
            layout,
        })
    }

    /// Caller guarantees `data.len()` matches `shape`.
    pub(crate) fn from_parts(data: Vec<f32>, shape: [usize; 4], layout: TensorLayout) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            data,
            shape,
            layout,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Where a source image comes from. Decoded by [`crate::pixels::decode_source`].
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Encoded image bytes (PNG, JPEG, ...) such as an uploaded file or blob.
    Encoded(Vec<u8>),
    /// An encoded image file on disk.
    File(PathBuf),
    /// An already-decoded image handle.
    Decoded(DynamicImage),
    /// A raw RGBA pixel buffer.
    Raw(PixelBuffer),
}

/// A fixed-size region of the source image.
///
/// `x`/`y` are the top-left offset in source pixel coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub pixels: PixelBuffer,
    pub x: u32,
    pub y: u32,
}

/// Tiles of one source image in row-major scan order.
#[derive(Debug, Clone)]
pub struct TileGrid {
    pub(crate) tiles: Vec<Tile>,
    pub source_width: u32,
    pub source_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub overlap: u32,
    pub columns: usize,
    pub rows: usize,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tile> {
        self.tiles.iter()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// `(x, y)` offsets in emission order.
    pub fn offsets(&self) -> Vec<(u32, u32)> {
        self.tiles.iter().map(|t| (t.x, t.y)).collect()
    }
}

impl IntoIterator for TileGrid {
    type Item = Tile;
    type IntoIter = std::vec::IntoIter<Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.into_iter()
    }
}

impl<'a> IntoIterator for &'a TileGrid {
    type Item = &'a Tile;
    type IntoIter = std::slice::Iter<'a, Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}
