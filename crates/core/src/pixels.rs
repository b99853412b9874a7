//! Pixel buffer utilities: source decoding and tensor conversion.
//!
//! Every source kind is funnelled through [`render_to_pixels`], the single
//! scaling primitive, so file bytes, decoded handles and raw buffers all end
//! up in the same RGBA8 representation.

use std::borrow::Cow;

use image::{imageops::FilterType, DynamicImage, ImageReader};

use crate::error::{Result, UpscaleError};
use crate::types::{ImageTensor, PixelBuffer, SourceKind, TensorLayout, RGBA_CHANNELS, RGB_CHANNELS};

/// Decode any [`SourceKind`] into an image handle without rescaling.
pub fn decode_source(source: &SourceKind) -> Result<Cow<'_, DynamicImage>> {
    match source {
        SourceKind::Encoded(bytes) => {
            if bytes.is_empty() {
                return Err(UpscaleError::decode("encoded source is empty"));
            }
            image::load_from_memory(bytes)
                .map(Cow::Owned)
                .map_err(UpscaleError::decode)
        }
        SourceKind::File(path) => {
            let reader = ImageReader::open(path)
                .map_err(|e| UpscaleError::decode(format!("{}: {e}", path.display())))?
                .with_guessed_format()
                .map_err(|e| UpscaleError::decode(format!("{}: {e}", path.display())))?;
            reader
                .decode()
                .map(Cow::Owned)
                .map_err(|e| UpscaleError::decode(format!("{}: {e}", path.display())))
        }
        SourceKind::Decoded(image) => Ok(Cow::Borrowed(image)),
        SourceKind::Raw(buffer) => Ok(Cow::Owned(DynamicImage::ImageRgba8(
            buffer.to_rgba_image(),
        ))),
    }
}

/// Render an image into an RGBA8 buffer of exactly `target_w x target_h`.
pub fn render_to_pixels(image: &DynamicImage, target_w: u32, target_h: u32) -> Result<PixelBuffer> {
    if target_w == 0 || target_h == 0 {
        return Err(UpscaleError::invalid(
            "target_size",
            format!("target size must be positive, got {target_w}x{target_h}"),
        ));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(UpscaleError::decode("source image has no pixels"));
    }

    let rgba = if image.width() == target_w && image.height() == target_h {
        image.to_rgba8()
    } else {
        image
            .resize_exact(target_w, target_h, FilterType::Triangle)
            .to_rgba8()
    };
    Ok(PixelBuffer::from_rgba_image(rgba))
}

/// Decode `source` and scale it to `target_w x target_h` RGBA pixels.
pub fn decode_to_pixels(source: &SourceKind, target_w: u32, target_h: u32) -> Result<PixelBuffer> {
    if let SourceKind::Raw(buffer) = source {
        if buffer.width() == target_w && buffer.height() == target_h {
            return Ok(buffer.clone());
        }
    }
    let image = decode_source(source)?;
    render_to_pixels(&image, target_w, target_h)
}

/// Decode `source` at its own resolution.
pub fn decode_native(source: &SourceKind) -> Result<PixelBuffer> {
    if let SourceKind::Raw(buffer) = source {
        return Ok(buffer.clone());
    }
    let image = decode_source(source)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(UpscaleError::decode("source image has no pixels"));
    }
    render_to_pixels(&image, image.width(), image.height())
}

/// Convert RGBA8 pixels → `[1, 3, H, W]` tensor in `[0, 1]`, alpha dropped.
pub fn pixels_to_tensor(buffer: &PixelBuffer, layout: TensorLayout) -> ImageTensor {
    let h = buffer.height() as usize;
    let w = buffer.width() as usize;
    let hw = h * w;

    let mut data = vec![0.0f32; hw * RGB_CHANNELS];
    for (i, px) in buffer.as_bytes().chunks_exact(RGBA_CHANNELS).enumerate() {
        let r = f32::from(px[0]) / 255.0;
        let g = f32::from(px[1]) / 255.0;
        let b = f32::from(px[2]) / 255.0;
        match layout {
            TensorLayout::Planar => {
                data[i] = r;
                data[hw + i] = g;
                data[2 * hw + i] = b;
            }
            TensorLayout::Interleaved => {
                data[i * 3] = r;
                data[i * 3 + 1] = g;
                data[i * 3 + 2] = b;
            }
        }
    }

    ImageTensor::from_parts(data, [1, RGB_CHANNELS, h, w], layout)
}

/// Convert a `[1, 3, H, W]` tensor back to opaque RGBA8 pixels.
///
/// Values are scaled by 255, rounded and clamped. The tensor is read in its
/// own layout.
pub fn tensor_to_pixels(tensor: &ImageTensor) -> Result<PixelBuffer> {
    let shape = tensor.shape();
    let [n, c, h, w] = shape;
    if n != 1 || c != RGB_CHANNELS || h == 0 || w == 0 {
        return Err(UpscaleError::shape(&[1, RGB_CHANNELS, h.max(1), w.max(1)], &shape));
    }

    let width = u32::try_from(w).map_err(|_| UpscaleError::shape(&[1, 3, h, w], &shape))?;
    let height = u32::try_from(h).map_err(|_| UpscaleError::shape(&[1, 3, h, w], &shape))?;

    let hw = h * w;
    let data = tensor.data();
    let mut rgba = vec![0u8; hw * RGBA_CHANNELS];
    for i in 0..hw {
        let (r, g, b) = match tensor.layout() {
            TensorLayout::Planar => (data[i], data[hw + i], data[2 * hw + i]),
            TensorLayout::Interleaved => (data[i * 3], data[i * 3 + 1], data[i * 3 + 2]),
        };
        let dst = i * RGBA_CHANNELS;
        rgba[dst] = to_byte(r);
        rgba[dst + 1] = to_byte(g);
        rgba[dst + 2] = to_byte(b);
        rgba[dst + 3] = u8::MAX;
    }

    PixelBuffer::new(width, height, rgba)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_byte(v: f32) -> u8 {
    // NaN casts to 0.
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}
