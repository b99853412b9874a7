//! Splits a source image into fixed-size overlapping tiles.
//!
//! Tiles advance by `tile - overlap` pixels and are emitted row-major (`y`
//! outer, `x` inner). The last tile of a row or column may reach past the
//! source edge; those pixels stay zero (transparent).

use tracing::debug;

use crate::error::{Result, UpscaleError};
use crate::types::{PixelBuffer, Tile, TileGrid, RGBA_CHANNELS};

/// Reject tile geometry that would produce a zero or negative stride.
pub fn validate_tile_geometry(tile_w: u32, tile_h: u32, overlap: u32) -> Result<()> {
    if tile_w == 0 || tile_h == 0 {
        return Err(UpscaleError::invalid(
            "tile_size",
            format!("tile size must be positive, got {tile_w}x{tile_h}"),
        ));
    }
    if tile_w <= overlap {
        return Err(UpscaleError::invalid(
            "tile_width",
            format!("tile width ({tile_w}) must be greater than overlap ({overlap})"),
        ));
    }
    if tile_h <= overlap {
        return Err(UpscaleError::invalid(
            "tile_height",
            format!("tile height ({tile_h}) must be greater than overlap ({overlap})"),
        ));
    }
    Ok(())
}

/// Offsets along one axis: `0, stride, 2*stride, ...` while `< len`.
pub fn tile_offsets(len: u32, tile: u32, overlap: u32) -> Vec<u32> {
    let stride = tile.saturating_sub(overlap);
    if stride == 0 {
        return Vec::new();
    }
    (0..len).step_by(stride as usize).collect()
}

/// `ceil(W / stride_x) * ceil(H / stride_y)`, or 0 for invalid geometry.
pub fn tile_count(width: u32, height: u32, tile_w: u32, tile_h: u32, overlap: u32) -> usize {
    if validate_tile_geometry(tile_w, tile_h, overlap).is_err() {
        return 0;
    }
    let cols = width.div_ceil(tile_w - overlap) as usize;
    let rows = height.div_ceil(tile_h - overlap) as usize;
    cols * rows
}

pub fn split_into_tiles(
    image: &PixelBuffer,
    tile_w: u32,
    tile_h: u32,
    overlap: u32,
) -> Result<TileGrid> {
    validate_tile_geometry(tile_w, tile_h, overlap)?;

    let xs = tile_offsets(image.width(), tile_w, overlap);
    let ys = tile_offsets(image.height(), tile_h, overlap);

    debug!(
        width = image.width(),
        height = image.height(),
        tile_w,
        tile_h,
        overlap,
        columns = xs.len(),
        rows = ys.len(),
        "Splitting image into tiles"
    );

    let mut tiles = Vec::with_capacity(xs.len() * ys.len());
    for &y in &ys {
        for &x in &xs {
            tiles.push(Tile {
                pixels: extract_region(image, x, y, tile_w, tile_h),
                x,
                y,
            });
        }
    }

    Ok(TileGrid {
        tiles,
        source_width: image.width(),
        source_height: image.height(),
        tile_width: tile_w,
        tile_height: tile_h,
        overlap,
        columns: xs.len(),
        rows: ys.len(),
    })
}

/// Copy a `w x h` region starting at `(x0, y0)`, clipped to the source.
fn extract_region(src: &PixelBuffer, x0: u32, y0: u32, w: u32, h: u32) -> PixelBuffer {
    let mut region = PixelBuffer::blank(w, h);

    let copy_w = w.min(src.width().saturating_sub(x0)) as usize;
    let copy_h = h.min(src.height().saturating_sub(y0)) as usize;
    if copy_w == 0 || copy_h == 0 {
        return region;
    }

    let src_stride = src.width() as usize * RGBA_CHANNELS;
    let dst_stride = w as usize * RGBA_CHANNELS;
    let row_bytes = copy_w * RGBA_CHANNELS;
    let src_bytes = src.as_bytes();
    let dst_bytes = region.as_bytes_mut();

    for row in 0..copy_h {
        let s = (y0 as usize + row) * src_stride + x0 as usize * RGBA_CHANNELS;
        let d = row * dst_stride;
        dst_bytes[d..d + row_bytes].copy_from_slice(&src_bytes[s..s + row_bytes]);
    }

    region
}
