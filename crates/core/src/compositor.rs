//! Reassembles upscaled tiles into the full output image.
//!
//! Overlapping regions are last-writer-wins: a later tile fully replaces the
//! pixels an earlier tile wrote. No blending is done, so seams can show at
//! tile boundaries when `overlap > 0`.

use crate::types::{PixelBuffer, RGBA_CHANNELS};

/// Output image under assembly, exclusively owned by one pipeline run.
#[derive(Debug)]
pub struct OutputCanvas {
    buffer: PixelBuffer,
}

impl OutputCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buffer: PixelBuffer::blank(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn pixels(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn into_pixels(self) -> PixelBuffer {
        self.buffer
    }
}

/// Write `tile` at `(source_x * factor, source_y * factor)`.
///
/// The write is clipped to the canvas; anything past its edges is dropped.
/// Returns the number of pixels written.
pub fn composite_tile(
    canvas: &mut OutputCanvas,
    tile: &PixelBuffer,
    source_x: u32,
    source_y: u32,
    upscale_factor: u32,
) -> usize {
    let dst_x = u64::from(source_x) * u64::from(upscale_factor);
    let dst_y = u64::from(source_y) * u64::from(upscale_factor);
    let canvas_w = u64::from(canvas.width());
    let canvas_h = u64::from(canvas.height());
    if dst_x >= canvas_w || dst_y >= canvas_h {
        return 0;
    }

    // Both offsets are below the canvas size, so they fit in usize.
    let dst_x = dst_x as usize;
    let dst_y = dst_y as usize;
    let copy_w = (tile.width() as usize).min(canvas_w as usize - dst_x);
    let copy_h = (tile.height() as usize).min(canvas_h as usize - dst_y);

    let canvas_stride = canvas_w as usize * RGBA_CHANNELS;
    let tile_stride = tile.width() as usize * RGBA_CHANNELS;
    let row_bytes = copy_w * RGBA_CHANNELS;
    let src = tile.as_bytes();
    let dst = canvas.buffer.as_bytes_mut();

    for row in 0..copy_h {
        let s = row * tile_stride;
        let d = (dst_y + row) * canvas_stride + dst_x * RGBA_CHANNELS;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }

    copy_w * copy_h
}
