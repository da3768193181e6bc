//! Result compositing and encoding.

use base64::Engine;
use image::{GrayImage, ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{InpaintError, Result};

/// Optional soft edge around the hole
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Feather {
    /// Gaussian sigma applied to the binary mask, in pixels
    pub radius: f32,
    /// How far the halo reaches outside the hole, 0..=1
    pub amount: f32,
}

/// Blend the network output back onto the original with a feathered mask.
///
/// Inside the hole the inpainted pixel always wins; outside it the blend
/// weight is `min(1, blurred_mask * (1 + amount))`. A radius of 0 gives a
/// hard composite.
pub fn feather_blend(
    original: &RgbImage,
    inpainted: &RgbImage,
    mask: &GrayImage,
    feather: Feather,
) -> Result<RgbImage> {
    let dims = original.dimensions();
    if inpainted.dimensions() != dims || mask.dimensions() != dims {
        return Err(InpaintError::Internal(format!(
            "blend size mismatch: original {:?}, inpainted {:?}, mask {:?}",
            dims,
            inpainted.dimensions(),
            mask.dimensions()
        )));
    }

    let binary = GrayImage::from_fn(dims.0, dims.1, |x, y| {
        if mask.get_pixel(x, y)[0] > 0 {
            image::Luma([255])
        } else {
            image::Luma([0])
        }
    });
    let blurred = if feather.radius > 0.0 {
        image::imageops::blur(&binary, feather.radius)
    } else {
        binary.clone()
    };

    let gain = 1.0 + feather.amount.clamp(0.0, 1.0);
    let out = RgbImage::from_fn(dims.0, dims.1, |x, y| {
        let alpha = if binary.get_pixel(x, y)[0] > 0 {
            1.0
        } else {
            (blurred.get_pixel(x, y)[0] as f32 / 255.0 * gain).min(1.0)
        };
        let o = original.get_pixel(x, y);
        let i = inpainted.get_pixel(x, y);
        let mix = |c: usize| (o[c] as f32 * (1.0 - alpha) + i[c] as f32 * alpha).round() as u8;
        Rgb([mix(0), mix(1), mix(2)])
    });

    Ok(out)
}

/// Encode as PNG in memory.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| InpaintError::Internal(format!("PNG encoding failed: {}", e)))?;
    Ok(buf.into_inner())
}

/// PNG + standard base64, as returned in `image_base64`.
pub fn encode_png_base64(image: &RgbImage) -> Result<String> {
    Ok(base64::engine::general_purpose::STANDARD.encode(encode_png(image)?))
}
